use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),
    #[error("client counter out of range for subnet")]
    ClientCounterOutOfRange,
    #[error("computed address is the network or broadcast address")]
    AddressIsNetworkOrBroadcast,
    #[error("invalid ip version nibble: {0}")]
    InvalidIpVersion(u8),
    #[error("packet too short")]
    TooShort,
    #[error("ipv4 header length field below minimum")]
    BadIhl,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

// Map TOML deserialization errors into the config error domain without adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
