//! Argument vectors for the daemons and the control tool inside a node.

use devnet_core::NodeConfig;

use crate::options::DaemonBinaries;

/// Builds every command issued against one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeCommands<'a> {
    node: &'a NodeConfig,
    simnet: bool,
    bins: &'a DaemonBinaries,
}

impl<'a> NodeCommands<'a> {
    pub fn new(node: &'a NodeConfig, simnet: bool, bins: &'a DaemonBinaries) -> Self {
        Self { node, simnet, bins }
    }

    /// Chain daemon, optionally mining to `mining_addr` and dialing `peers`.
    pub fn chain_daemon(&self, mining_addr: Option<&str>, peers: &[String]) -> Vec<String> {
        let mut argv = vec![
            self.bins.chain.clone(),
            format!("--rpcuser={}", self.node.user),
            format!("--rpcpass={}", self.node.pass),
            format!("--rpclisten=0.0.0.0:{}", self.node.rpc_port(self.simnet)),
            format!("--listen=0.0.0.0:{}", self.node.port),
        ];
        if self.simnet {
            argv.push("--simnet".into());
        }
        if let Some(addr) = mining_addr {
            argv.push(format!("--miningaddr={addr}"));
            argv.push("--txindex".into());
        }
        argv.extend(peers.iter().map(|peer| format!("--connect={peer}")));
        argv
    }

    pub fn wallet_daemon(&self) -> Vec<String> {
        let mut argv = vec![
            self.bins.wallet.clone(),
            "-u".into(),
            self.node.user.clone(),
            "-P".into(),
            self.node.pass.clone(),
        ];
        if self.simnet {
            argv.push("--simnet".into());
        }
        argv
    }

    /// Interactive wallet creation.
    pub fn create_wallet(&self) -> Vec<String> {
        let mut argv = self.wallet_daemon();
        argv.push("--create".into());
        argv
    }

    /// Control-tool call against the chain daemon.
    pub fn chain_ctl(&self, args: &[&str]) -> Vec<String> {
        self.ctl(false, args)
    }

    /// Control-tool call against the wallet daemon.
    pub fn wallet_ctl(&self, args: &[&str]) -> Vec<String> {
        self.ctl(true, args)
    }

    fn ctl(&self, wallet: bool, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            self.bins.ctl.clone(),
            format!("--rpcuser={}", self.node.user),
            format!("--rpcpass={}", self.node.pass),
        ];
        if wallet {
            argv.push("--wallet".into());
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        if self.simnet {
            argv.push("--simnet".into());
        }
        argv
    }

    pub fn pidof_chain(&self) -> Vec<String> {
        vec!["pidof".into(), "-x".into(), self.bins.chain.clone()]
    }
}

/// `kill` for every pid in `pidof` output.
pub fn kill(pids: &str) -> Vec<String> {
    std::iter::once("kill".to_string())
        .chain(pids.split_whitespace().map(str::to_string))
        .collect()
}
