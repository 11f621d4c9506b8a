//! Client and server configuration.
//!
//! Both binaries accept the same settings through flags or a TOML file
//! with a `[snell-client]` / `[snell-server]` table. When a file is
//! given it wins over the flags wholesale, matching the original
//! deployments' behavior.

use serde::Deserialize;

use crate::crypto::CipherKind;
use crate::error::{Error, Result};
use crate::obfs::ObfsMode;

/// Default listen address for both binaries.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:18888";

/// Default obfuscation cover host.
pub const DEFAULT_OBFS_HOST: &str = "bing.com";

/// Settings for the client-side proxy.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address.
    pub listen: String,
    /// Remote snell server `host:port`.
    pub server: String,
    /// Obfuscation applied outside the AEAD layer.
    pub obfs: ObfsMode,
    /// Cover hostname for the obfuscated first flight.
    pub obfs_host: String,
    /// Pre-shared key.
    pub psk: String,
    /// Speak protocol v2 (request reuse, AES-128-GCM).
    pub v2: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            server: String::new(),
            obfs: ObfsMode::Off,
            obfs_host: DEFAULT_OBFS_HOST.to_owned(),
            psk: String::new(),
            v2: true,
        }
    }
}

impl ClientConfig {
    /// The cipher implied by the protocol version.
    pub fn cipher_kind(&self) -> CipherKind {
        if self.v2 {
            CipherKind::Aes128Gcm
        } else {
            CipherKind::ChaCha20Poly1305
        }
    }

    /// Port of the remote server, for the obfs `Host` header.
    pub fn server_port(&self) -> Result<u16> {
        let (_, port) = self
            .server
            .rsplit_once(':')
            .ok_or_else(|| Error::config("server address must be host:port"))?;
        port.parse()
            .map_err(|_| Error::config(format!("invalid server port {port:?}")))
    }

    /// Check the settings that are fatal at startup.
    pub fn validate(&mut self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("empty server address"));
        }
        self.server_port()?;
        if self.obfs_host.is_empty() {
            self.obfs_host = DEFAULT_OBFS_HOST.to_owned();
        }
        Ok(())
    }
}

/// Settings for the server-side proxy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address.
    pub listen: String,
    /// Obfuscation expected from clients.
    pub obfs: ObfsMode,
    /// Pre-shared key.
    pub psk: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            obfs: ObfsMode::Off,
            psk: String::new(),
        }
    }
}

impl ServerConfig {
    /// Check the settings that are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::config("empty listen address"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(rename = "snell-client")]
    client: Option<ClientSection>,
    #[serde(rename = "snell-server")]
    server: Option<ServerSection>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ClientSection {
    listen: Option<String>,
    server: Option<String>,
    obfs: Option<String>,
    #[serde(rename = "obfs-host")]
    obfs_host: Option<String>,
    psk: Option<String>,
    version: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    listen: Option<String>,
    obfs: Option<String>,
    psk: Option<String>,
}

fn parse_file(content: &str) -> Result<ConfigFile> {
    toml::from_str(content).map_err(|e| Error::config(format!("bad config file: {e}")))
}

/// Load the `[snell-client]` table from a TOML config file.
pub fn load_client_config(path: &str) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
    let section = parse_file(&content)?
        .client
        .ok_or_else(|| Error::config(format!("section [snell-client] not found in {path}")))?;

    let defaults = ClientConfig::default();
    let mut config = ClientConfig {
        listen: section.listen.unwrap_or(defaults.listen),
        server: section.server.unwrap_or_default(),
        obfs: ObfsMode::parse(section.obfs.as_deref().unwrap_or(""))?,
        obfs_host: section.obfs_host.unwrap_or(defaults.obfs_host),
        psk: section.psk.unwrap_or_default(),
        v2: section.version.as_deref().unwrap_or("2") == "2",
    };
    config.validate()?;
    Ok(config)
}

/// Load the `[snell-server]` table from a TOML config file.
pub fn load_server_config(path: &str) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {path}: {e}")))?;
    let section = parse_file(&content)?
        .server
        .ok_or_else(|| Error::config(format!("section [snell-server] not found in {path}")))?;

    let defaults = ServerConfig::default();
    let config = ServerConfig {
        listen: section.listen.unwrap_or(defaults.listen),
        obfs: ObfsMode::parse(section.obfs.as_deref().unwrap_or(""))?,
        psk: section.psk.unwrap_or_default(),
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.obfs_host, DEFAULT_OBFS_HOST);
        assert!(config.v2);
        assert_eq!(config.cipher_kind(), CipherKind::Aes128Gcm);
    }

    #[test]
    fn test_empty_server_is_fatal() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_err());

        config.server = "snell.example.test:18888".to_owned();
        config.obfs_host = String::new();
        config.validate().unwrap();
        assert_eq!(config.obfs_host, DEFAULT_OBFS_HOST);
        assert_eq!(config.server_port().unwrap(), 18888);
    }

    #[test]
    fn test_client_file_parsing() {
        let content = r#"
[snell-client]
listen = "127.0.0.1:1080"
server = "1.2.3.4:443"
obfs = "tls"
obfs-host = "example.test"
psk = "pass"
version = "1"
"#;
        let file = parse_file(content).unwrap();
        let section = file.client.unwrap();
        assert_eq!(section.listen.as_deref(), Some("127.0.0.1:1080"));
        assert_eq!(section.obfs_host.as_deref(), Some("example.test"));
        assert_eq!(section.version.as_deref(), Some("1"));
    }

    #[test]
    fn test_version_selects_cipher() {
        let mut v1 = ClientConfig {
            server: "s:1".into(),
            v2: false,
            ..Default::default()
        };
        v1.validate().unwrap();
        assert_eq!(v1.cipher_kind(), CipherKind::ChaCha20Poly1305);
    }

    #[test]
    fn test_server_file_parsing() {
        let content = r#"
[snell-server]
listen = "0.0.0.0:443"
obfs = "http"
psk = "pass"
"#;
        let file = parse_file(content).unwrap();
        let section = file.server.unwrap();
        assert_eq!(section.listen.as_deref(), Some("0.0.0.0:443"));
        assert_eq!(section.obfs.as_deref(), Some("http"));
    }

    #[test]
    fn test_unknown_obfs_is_fatal() {
        assert!(ObfsMode::parse("websocket").is_err());
    }
}
