use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

/// How many confirmations before we treat a trigger transaction as
/// permanently in the chain.
pub const IRREVERSIBLE_THRESHOLD: u32 = 4;

/// A network we can watch. `Tape` is a signet-based test network operated
/// alongside the public ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkId {
    Bitcoin,
    Testnet,
    Tape,
    Regtest,
}

impl NetworkId {
    pub const ALL: [NetworkId; 4] = [
        NetworkId::Bitcoin,
        NetworkId::Testnet,
        NetworkId::Tape,
        NetworkId::Regtest,
    ];

    /// Address parameters for decoding output scripts on this network.
    pub fn address_network(&self) -> bitcoin::Network {
        match self {
            NetworkId::Bitcoin => bitcoin::Network::Bitcoin,
            NetworkId::Testnet => bitcoin::Network::Testnet,
            // Tape is a signet variant, addresses use signet parameters
            NetworkId::Tape => bitcoin::Network::Signet,
            NetworkId::Regtest => bitcoin::Network::Regtest,
        }
    }

    /// The compiled-in Esplora base URL, if there is one. Regtest is
    /// operator-supplied at startup.
    pub fn default_esplora_url(&self) -> Option<&'static str> {
        match self {
            NetworkId::Bitcoin => Some("https://blockstream.info/api"),
            NetworkId::Testnet => Some("https://mempool.space/testnet/api"),
            NetworkId::Tape => Some("https://tape.rewindbitcoin.com/api"),
            NetworkId::Regtest => None,
        }
    }

    /// Delay between two monitor cycles. Sped up on regtest for testing.
    pub fn cycle_interval(&self) -> Duration {
        match self {
            NetworkId::Regtest => Duration::from_secs(30),
            _ => Duration::from_secs(60),
        }
    }
}

impl FromStr for NetworkId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" => Ok(Self::Bitcoin),
            "testnet" => Ok(Self::Testnet),
            "tape" => Ok(Self::Tape),
            "regtest" => Ok(Self::Regtest),
            _ => Err(()),
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::Bitcoin => "bitcoin",
                Self::Testnet => "testnet",
                Self::Tape => "tape",
                Self::Regtest => "regtest",
            }
        )
    }
}

/// Process-wide configuration, built from the command line at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Folder holding our per-network state databases as well as the
    /// externally-maintained authorized-addresses databases.
    pub db_folder: PathBuf,
    /// Networks we run a monitor for, in startup order.
    pub networks: Vec<NetworkId>,
    /// Esplora base URL for regtest, when enabled.
    pub regtest_url: Option<String>,
    /// Whether registrations may bind an authorized commitment.
    pub with_commitments: bool,
    /// Listening port for the HTTP surface. 0 picks an ephemeral port.
    pub port: u16,
}

impl Config {
    /// Path of the watchtower state database for the given network.
    pub fn db_file(&self, network: NetworkId) -> PathBuf {
        self.db_folder.join(format!("watchtower.{}.sqlite", network))
    }

    /// Path of the read-only authorized-addresses database for the given
    /// network. Maintained by an external process.
    pub fn addresses_db_file(&self, network: NetworkId) -> PathBuf {
        self.db_folder.join(format!("{}.sqlite", network))
    }

    pub fn is_enabled(&self, network: NetworkId) -> bool {
        self.networks.contains(&network)
    }

    /// The Esplora base URL for a network we monitor.
    pub fn esplora_url(&self, network: NetworkId) -> Option<String> {
        match network {
            NetworkId::Regtest => self.regtest_url.clone(),
            _ => network.default_esplora_url().map(|url| url.to_string()),
        }
    }
}
