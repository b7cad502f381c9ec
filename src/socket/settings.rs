//! Declarative client configuration.
//!
//! A [`ClientSettings`] bundle mirrors the option-array style of
//! configuration: flat keys, deserializable from JSON, applied to a
//! socket in one call. Cross-field validation happens at apply time so a
//! bundle can be built up incrementally.

use crate::base::neterror::NetError;
use crate::socket::framing::FramingConfig;
use crate::socket::proxy::ProxyConfig;
use serde::Deserialize;
use std::time::Duration;

/// Client socket options.
///
/// `timeout` and `connect_timeout` are given in (fractional) seconds;
/// zero and negative values mean "no timeout".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub open_eof_check: bool,
    pub open_eof_split: bool,
    pub package_eof: Option<String>,

    pub open_length_check: bool,
    pub package_length_type: Option<char>,
    pub package_length_offset: usize,
    pub package_body_offset: usize,
    pub package_max_length: Option<usize>,

    pub socket_buffer_size: Option<usize>,
    pub open_tcp_nodelay: Option<bool>,
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,

    #[serde(deserialize_with = "seconds")]
    pub timeout: Option<Duration>,
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Option<Duration>,

    pub socks5_host: Option<String>,
    pub socks5_port: Option<u16>,
    pub socks5_username: Option<String>,
    pub socks5_password: Option<String>,
    /// Resolve target hostnames on the proxy instead of locally.
    pub socks5_dns_tunnel: bool,

    pub http_proxy_host: Option<String>,
    pub http_proxy_port: Option<u16>,
    pub http_proxy_user: Option<String>,
    pub http_proxy_password: Option<String>,
    pub open_ssl: bool,
}

fn seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = Option::<f64>::deserialize(deserializer)?;
    Ok(match secs {
        Some(s) if s > 0.0 => Some(Duration::from_secs_f64(s)),
        _ => None,
    })
}

impl ClientSettings {
    pub fn from_json(input: &str) -> Result<ClientSettings, NetError> {
        serde_json::from_str(input)
            .map_err(|e| NetError::InvalidSetting(format!("bad settings: {e}")))
    }

    /// The framing configuration these settings describe, if any.
    /// EOF-check and length-check are mutually exclusive.
    pub fn framing(&self) -> Result<Option<FramingConfig>, NetError> {
        if self.open_eof_check && self.open_length_check {
            return Err(NetError::InvalidSetting(
                "open_eof_check and open_length_check are mutually exclusive".into(),
            ));
        }
        if let Some(0) = self.package_max_length {
            return Err(NetError::InvalidSetting(
                "package_max_length must be positive".into(),
            ));
        }
        let mut config = if self.open_eof_check || self.open_eof_split {
            let marker = self.package_eof.as_deref().ok_or_else(|| {
                NetError::InvalidSetting("eof check requires package_eof".into())
            })?;
            FramingConfig::eof(marker.as_bytes(), self.open_eof_split)?
        } else if self.open_length_check {
            let pack_char = self.package_length_type.ok_or_else(|| {
                NetError::InvalidSetting("length check requires package_length_type".into())
            })?;
            FramingConfig::length_prefixed(
                pack_char,
                self.package_length_offset,
                self.package_body_offset,
            )?
        } else {
            return Ok(None);
        };
        if let Some(max) = self.package_max_length {
            config = config.max_length(max);
        }
        Ok(Some(config))
    }

    /// The proxy these settings describe, if any. At most one proxy
    /// family may be configured.
    pub fn proxy(&self) -> Result<Option<ProxyConfig>, NetError> {
        match (&self.socks5_host, &self.http_proxy_host) {
            (Some(_), Some(_)) => Err(NetError::InvalidSetting(
                "socks5 and http proxy are mutually exclusive".into(),
            )),
            (Some(host), None) => {
                let port = self.socks5_port.ok_or_else(|| {
                    NetError::InvalidSetting("socks5_host requires socks5_port".into())
                })?;
                let mut proxy = ProxyConfig::socks5(host.clone(), port)
                    .with_dns_tunnel(self.socks5_dns_tunnel);
                if let (Some(user), Some(pass)) =
                    (&self.socks5_username, &self.socks5_password)
                {
                    proxy = proxy.with_auth(user.clone(), pass.clone());
                }
                Ok(Some(proxy))
            }
            (None, Some(host)) => {
                let port = self.http_proxy_port.ok_or_else(|| {
                    NetError::InvalidSetting("http_proxy_host requires http_proxy_port".into())
                })?;
                let mut proxy = ProxyConfig::http(host.clone(), port);
                if let (Some(user), Some(pass)) =
                    (&self.http_proxy_user, &self.http_proxy_password)
                {
                    proxy = proxy.with_auth(user.clone(), pass.clone());
                }
                if self.open_ssl {
                    if let ProxyConfig::HttpConnect { ssl, .. } = &mut proxy {
                        *ssl = true;
                    }
                }
                Ok(Some(proxy))
            }
            (None, None) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::framing::FramingMode;

    #[test]
    fn parses_framing_options_from_json() {
        let settings = ClientSettings::from_json(
            r#"{
                "open_length_check": true,
                "package_length_type": "N",
                "package_length_offset": 4,
                "package_body_offset": 8,
                "package_max_length": 65536,
                "timeout": 2.5
            }"#,
        )
        .unwrap();
        let config = settings.framing().unwrap().unwrap();
        assert!(matches!(config.mode, FramingMode::LengthPrefixed { .. }));
        assert_eq!(config.package_max_length, 65536);
        assert_eq!(settings.timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn rejects_unknown_keys_and_conflicts() {
        assert!(ClientSettings::from_json(r#"{"open_oef_check": true}"#).is_err());

        let settings = ClientSettings {
            open_eof_check: true,
            open_length_check: true,
            ..Default::default()
        };
        assert!(settings.framing().is_err());
    }

    #[test]
    fn eof_check_requires_marker() {
        let settings = ClientSettings {
            open_eof_check: true,
            ..Default::default()
        };
        assert!(settings.framing().is_err());
    }

    #[test]
    fn at_most_one_proxy_family() {
        let settings = ClientSettings {
            socks5_host: Some("a".into()),
            socks5_port: Some(1080),
            http_proxy_host: Some("b".into()),
            http_proxy_port: Some(8080),
            ..Default::default()
        };
        assert!(settings.proxy().is_err());
    }

    #[test]
    fn builds_socks5_proxy_with_auth() {
        let settings = ClientSettings::from_json(
            r#"{
                "socks5_host": "127.0.0.1",
                "socks5_port": 1080,
                "socks5_username": "u",
                "socks5_password": "p",
                "socks5_dns_tunnel": true
            }"#,
        )
        .unwrap();
        match settings.proxy().unwrap().unwrap() {
            ProxyConfig::Socks5 {
                username, dns_tunnel, ..
            } => {
                assert_eq!(username.as_deref(), Some("u"));
                assert!(dns_tunnel);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
