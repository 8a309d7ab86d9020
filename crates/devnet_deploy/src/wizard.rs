use std::time::Duration;

use devnet_core::DevnetError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::options::PromptCheck;

/// Keepalive the wallet tool writes while it is busy.
pub const IDLE_FRAME: &[u8] = b"\r\n";

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Position in the wallet-creation dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WizardState {
    AwaitPassphrase,
    AwaitConfirm,
    AwaitEncryptionChoice,
    AwaitSeedImportChoice,
    AwaitSeedAck,
    Done,
}

impl WizardState {
    pub fn name(self) -> &'static str {
        match self {
            Self::AwaitPassphrase => "AwaitPassphrase",
            Self::AwaitConfirm => "AwaitConfirm",
            Self::AwaitEncryptionChoice => "AwaitEncryptionChoice",
            Self::AwaitSeedImportChoice => "AwaitSeedImportChoice",
            Self::AwaitSeedAck => "AwaitSeedAck",
            Self::Done => "Done",
        }
    }

    pub fn next(self) -> Self {
        match self {
            Self::AwaitPassphrase => Self::AwaitConfirm,
            Self::AwaitConfirm => Self::AwaitEncryptionChoice,
            Self::AwaitEncryptionChoice => Self::AwaitSeedImportChoice,
            Self::AwaitSeedImportChoice => Self::AwaitSeedAck,
            Self::AwaitSeedAck | Self::Done => Self::Done,
        }
    }

    /// Text the prompt for this state is expected to contain (case-insensitive).
    pub fn keyword(self) -> &'static str {
        match self {
            Self::AwaitPassphrase => "passphrase",
            Self::AwaitConfirm => "confirm",
            Self::AwaitEncryptionChoice => "encryption",
            Self::AwaitSeedImportChoice => "seed",
            Self::AwaitSeedAck => "ok",
            Self::Done => "",
        }
    }

    fn answer(self, passphrase: &str) -> &str {
        match self {
            Self::AwaitPassphrase | Self::AwaitConfirm => passphrase,
            Self::AwaitEncryptionChoice | Self::AwaitSeedImportChoice => "no",
            Self::AwaitSeedAck => "OK",
            Self::Done => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Result of a completed dialogue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WizardOutcome {
    pub answers_sent: usize,
    /// Output seen after the last answer. Holds the seed display, unparsed.
    pub trailing: Vec<u8>,
}

/// Answers the wallet tool's creation prompts over a raw byte stream.
#[derive(Debug, Clone)]
pub struct WizardDriver {
    passphrase: String,
    step_timeout: Duration,
    drain_timeout: Duration,
    check: PromptCheck,
}

impl WizardDriver {
    pub fn new(passphrase: impl Into<String>, step_timeout: Duration) -> Self {
        Self {
            passphrase: passphrase.into(),
            step_timeout,
            drain_timeout: step_timeout,
            check: PromptCheck::Blind,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_prompt_check(mut self, check: PromptCheck) -> Self {
        self.check = check;
        self
    }

    /// Walk every state up to `Done`, then drain once.
    pub async fn run<S>(&self, stream: &mut S) -> Result<WizardOutcome, DevnetError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let mut state = WizardState::AwaitPassphrase;
        let mut outcome = WizardOutcome::default();

        while state != WizardState::Done {
            let prompt = match tokio::time::timeout(self.step_timeout, read_prompt(stream)).await {
                Err(_) => {
                    return Err(DevnetError::WizardTimeout {
                        state: state.name(),
                        after: self.step_timeout,
                    });
                }
                Ok(Err(e)) => {
                    return Err(DevnetError::WizardDesync {
                        state: state.name(),
                        reason: format!("read failed: {e}"),
                    });
                }
                Ok(Ok(None)) => {
                    return Err(DevnetError::WizardDesync {
                        state: state.name(),
                        reason: "stream closed before the dialogue finished".into(),
                    });
                }
                Ok(Ok(Some(prompt))) => prompt,
            };
            self.check_prompt(state, &prompt)?;

            debug!(state = state.name(), "answering wizard prompt");
            let line = format!("{}\n", state.answer(&self.passphrase));
            write_answer(stream, line.as_bytes())
                .await
                .map_err(|e| DevnetError::WizardDesync {
                    state: state.name(),
                    reason: format!("write failed: {e}"),
                })?;
            outcome.answers_sent += 1;
            state = state.next();
        }

        // Nothing depends on the drain: the seed was acknowledged already.
        match tokio::time::timeout(self.drain_timeout, read_prompt(stream)).await {
            Ok(Ok(Some(rest))) => outcome.trailing = rest,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "wallet wizard drain failed"),
            Err(_) => warn!(after = ?self.drain_timeout, "wallet wizard drain timed out"),
        }
        Ok(outcome)
    }

    fn check_prompt(&self, state: WizardState, prompt: &[u8]) -> Result<(), DevnetError> {
        if self.check == PromptCheck::Blind {
            return Ok(());
        }
        let text = String::from_utf8_lossy(prompt).to_lowercase();
        if text.contains(state.keyword()) {
            Ok(())
        } else {
            Err(DevnetError::WizardDesync {
                state: state.name(),
                reason: format!("unexpected prompt {:?}", text.trim()),
            })
        }
    }
}

/// Read until something other than an idle frame arrives. `None` on EOF.
async fn read_prompt<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if is_idle(&buf[..n]) {
            continue;
        }
        buf.truncate(n);
        return Ok(Some(buf));
    }
}

/// One or more back-to-back idle frames.
fn is_idle(chunk: &[u8]) -> bool {
    !chunk.is_empty()
        && chunk.len() % IDLE_FRAME.len() == 0
        && chunk.chunks_exact(IDLE_FRAME.len()).all(|c| c == IDLE_FRAME)
}

async fn write_answer<S>(stream: &mut S, line: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(line).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const PROMPTS: [&str; 5] = [
        "Enter the private passphrase for your new wallet: ",
        "Confirm passphrase: ",
        "Do you want to add an additional layer of encryption for public data? (n/no/y/yes) [no]: ",
        "Do you have an existing wallet seed you want to use? (n/no/y/yes) [no]: ",
        "Once you have stored the seed in a safe and secure location, enter \"OK\" to continue: ",
    ];

    async fn read_line(stream: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1, "driver hung up");
            if byte[0] == b'\n' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    /// Plays `prompts`, each preceded by `idle` keepalives, and returns the answers.
    async fn play(mut server: DuplexStream, prompts: Vec<String>, idle: usize) -> Vec<String> {
        let mut answers = Vec::new();
        for prompt in prompts {
            for _ in 0..idle {
                server.write_all(IDLE_FRAME).await.unwrap();
                tokio::task::yield_now().await;
            }
            server.write_all(prompt.as_bytes()).await.unwrap();
            answers.push(read_line(&mut server).await);
        }
        server.write_all(b"wallet created\r\n").await.unwrap();
        server.shutdown().await.unwrap();
        answers
    }

    fn prompts() -> Vec<String> {
        PROMPTS.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn states_advance_in_order() {
        let mut state = WizardState::AwaitPassphrase;
        let mut seen = vec![state];
        while state != WizardState::Done {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(WizardState::Done.next(), WizardState::Done);
    }

    #[tokio::test]
    async fn sends_five_answers_in_order() {
        let (mut client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(play(server, prompts(), 0));

        let driver = WizardDriver::new("walletpass", Duration::from_secs(5));
        let outcome = driver.run(&mut client).await.unwrap();

        assert_eq!(outcome.answers_sent, 5);
        assert_eq!(peer.await.unwrap(), ["walletpass", "walletpass", "no", "no", "OK"]);
        assert_eq!(outcome.trailing, b"wallet created\r\n");
    }

    #[tokio::test]
    async fn idle_frames_never_trigger_answers() {
        let (mut client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(play(server, prompts(), 7));

        let driver = WizardDriver::new("pw", Duration::from_secs(5));
        let outcome = driver.run(&mut client).await.unwrap();

        assert_eq!(outcome.answers_sent, 5);
        assert_eq!(peer.await.unwrap(), ["pw", "pw", "no", "no", "OK"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_prompt_times_out_with_state() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            server.write_all(PROMPTS[0].as_bytes()).await.unwrap();
            let first = read_line(&mut server).await;
            // Keep the stream open but never prompt again.
            std::future::pending::<()>().await;
            drop((server, first));
        });

        let driver = WizardDriver::new("pw", Duration::from_secs(30));
        let err = driver.run(&mut client).await.unwrap_err();
        assert!(
            matches!(err, DevnetError::WizardTimeout { state: "AwaitConfirm", .. }),
            "got: {err:?}"
        );
        peer.abort();
    }

    #[tokio::test]
    async fn early_eof_is_desync() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            for prompt in &PROMPTS[..2] {
                server.write_all(prompt.as_bytes()).await.unwrap();
                read_line(&mut server).await;
            }
            server.shutdown().await.unwrap();
        });

        let driver = WizardDriver::new("pw", Duration::from_secs(5));
        let err = driver.run(&mut client).await.unwrap_err();
        assert!(
            matches!(err, DevnetError::WizardDesync { state: "AwaitEncryptionChoice", .. }),
            "got: {err:?}"
        );
    }

    #[test]
    fn coalesced_idle_frames_are_idle() {
        assert!(is_idle(b"\r\n"));
        assert!(is_idle(b"\r\n\r\n\r\n"));
        assert!(!is_idle(b"\r\nConfirm passphrase: "));
        assert!(!is_idle(b""));
    }

    #[tokio::test]
    async fn keyword_check_rejects_wrong_prompt() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut swapped = prompts();
        swapped.swap(2, 3);
        tokio::spawn(play(server, swapped, 0));

        let driver = WizardDriver::new("pw", Duration::from_secs(5))
            .with_prompt_check(PromptCheck::Keyword);
        let err = driver.run(&mut client).await.unwrap_err();
        assert!(
            matches!(err, DevnetError::WizardDesync { state: "AwaitEncryptionChoice", .. }),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn keyword_check_accepts_real_prompts() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(play(server, prompts(), 2));

        let driver = WizardDriver::new("pw", Duration::from_secs(5))
            .with_prompt_check(PromptCheck::Keyword);
        assert_eq!(driver.run(&mut client).await.unwrap().answers_sent, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_is_not_fatal() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            for prompt in PROMPTS {
                server.write_all(prompt.as_bytes()).await.unwrap();
                read_line(&mut server).await;
            }
            std::future::pending::<()>().await;
            drop(server);
        });

        let driver = WizardDriver::new("pw", Duration::from_secs(5))
            .with_drain_timeout(Duration::from_secs(1));
        let outcome = driver.run(&mut client).await.unwrap();
        assert_eq!(outcome.answers_sent, 5);
        assert!(outcome.trailing.is_empty());
        peer.abort();
    }
}
