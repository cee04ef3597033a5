//! Configuration management

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub sip: SipConfig,
    pub ims: ImsConfig,
    pub media: MediaConfig,
    pub timers: TimerConfig,
}

/// Local transport and proxy addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub proxy_address: String,
    pub proxy_port: u16,
    pub user_agent: String,
}

/// IMS identity and registration credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImsConfig {
    pub public_user_id: String,
    pub domain: String,
    pub auth_username: String,
    pub auth_password: String,
    /// Requested REGISTER binding lifetime in seconds
    pub expire_period: u32,
    pub feature_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Local port for MSRP connections
    pub msrp_port: u16,
    /// Local port base for RTP sockets
    pub rtp_port: u16,
    pub max_chunk_size: usize,
    /// Largest file accepted or offered over file transfer, in bytes
    pub max_file_size: u64,
    /// Mime types accepted in chat and file sessions
    pub accept_types: Vec<String>,
    /// Preferred audio codecs in negotiation order
    pub audio_codecs: Vec<String>,
}

/// All values in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub transaction_timeout: u64,
    pub ringing_period: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sip: SipConfig {
                bind_address: "0.0.0.0".to_string(),
                bind_port: 5060,
                proxy_address: "127.0.0.1".to_string(),
                proxy_port: 5060,
                user_agent: "magpie/0.1".to_string(),
            },
            ims: ImsConfig {
                public_user_id: "sip:user@localhost".to_string(),
                domain: "localhost".to_string(),
                auth_username: "user".to_string(),
                auth_password: String::new(),
                expire_period: 600,
                feature_tags: vec![
                    "+g.oma.sip-im".to_string(),
                    "+g.3gpp.iari-ref=\"urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.ft\""
                        .to_string(),
                ],
            },
            media: MediaConfig {
                msrp_port: 2855,
                rtp_port: 7000,
                max_chunk_size: 2048,
                max_file_size: 10 * 1024 * 1024,
                accept_types: vec![
                    "text/plain".to_string(),
                    "message/cpim".to_string(),
                ],
                audio_codecs: vec!["PCMU".to_string(), "PCMA".to_string()],
            },
            timers: TimerConfig {
                transaction_timeout: 30,
                ringing_period: 60,
            },
        }
    }
}

impl ClientConfig {
    /// Load from a toml file with environment overrides (MAGPIE_SIP__BIND_PORT
    /// and friends), falling back to defaults for anything unset.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let defaults = config::Config::try_from(&ClientConfig::default())?;
        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("MAGPIE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
