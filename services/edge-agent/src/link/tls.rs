//! Client TLS material shared by the link transports.

use std::path::Path;

use crate::config::TlsConfig;

use super::LinkError;

/// PEM-encoded CA and client identity loaded from disk.
#[derive(Clone, Default)]
pub struct TlsMaterial {
    ca: Option<Vec<u8>>,
    identity: Option<(Vec<u8>, Vec<u8>)>,
    insecure_skip_verify: bool,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &self.ca.is_some())
            .field("identity", &self.identity.is_some())
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, LinkError> {
    std::fs::read(path).map_err(|e| LinkError::Tls(format!("{}: {e}", path.display())))
}

impl TlsMaterial {
    /// Load the configured files.
    ///
    /// With `require` set, a missing client certificate or key is fatal.
    pub fn load(cfg: &TlsConfig, require: bool) -> Result<Self, LinkError> {
        let identity = match (&cfg.cert, &cfg.key) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            (None, None) => None,
            _ => return Err(LinkError::Tls("cert and key must be configured together".into())),
        };
        if require && identity.is_none() {
            return Err(LinkError::TlsConfigMissing);
        }

        Ok(Self {
            ca: cfg.ca.as_deref().map(read_pem).transpose()?,
            identity,
            insecure_skip_verify: cfg.insecure_skip_verify,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.identity.is_none() && !self.insecure_skip_verify
    }

    /// Connector for the websocket transport.
    pub fn native_connector(&self) -> Result<native_tls::TlsConnector, LinkError> {
        let mut builder = native_tls::TlsConnector::builder();
        if let Some(ca) = &self.ca {
            let cert = native_tls::Certificate::from_pem(ca).map_err(tls_err)?;
            builder.add_root_certificate(cert);
        }
        if let Some((cert, key)) = &self.identity {
            let identity = native_tls::Identity::from_pkcs8(cert, key).map_err(tls_err)?;
            builder.identity(identity);
        }
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
        }
        builder.build().map_err(tls_err)
    }

    /// Apply the material to an HTTP client builder.
    pub fn apply_http(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, LinkError> {
        if let Some(ca) = &self.ca {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(ca).map_err(tls_err)?);
        }
        if let Some((cert, key)) = &self.identity {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            builder = builder.identity(reqwest::Identity::from_pem(&pem).map_err(tls_err)?);
        }
        if self.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

impl TlsMaterial {
    /// Transport for the MQTT link. `secure` is set for `mqtts`/`ssl` broker
    /// addresses, which use TLS even without local material.
    pub fn mqtt_transport(&self, secure: bool) -> Result<rumqttc::Transport, LinkError> {
        if !secure && self.is_empty() {
            return Ok(rumqttc::Transport::Tcp);
        }
        if self.insecure_skip_verify {
            return Err(LinkError::Tls(
                "insecure_skip_verify is not supported by the MQTT link".into(),
            ));
        }
        match (&self.ca, &self.identity) {
            (Some(ca), identity) => Ok(rumqttc::Transport::tls(ca.clone(), identity.clone(), None)),
            (None, Some(_)) => Err(LinkError::Tls(
                "MQTT client certificates need a CA bundle".into(),
            )),
            (None, None) => Ok(rumqttc::Transport::tls_with_default_config()),
        }
    }
}

fn tls_err(e: impl std::fmt::Display) -> LinkError {
    LinkError::Tls(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_required_tls_without_material_fails() {
        let err = TlsMaterial::load(&TlsConfig::default(), true).unwrap_err();
        assert!(matches!(err, LinkError::TlsConfigMissing));
    }

    #[test]
    fn test_optional_tls_without_material_is_empty() {
        let material = TlsMaterial::load(&TlsConfig::default(), false).unwrap();
        assert!(material.is_empty());
    }

    #[test]
    fn test_half_identity_is_rejected() {
        let cfg = TlsConfig {
            cert: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..TlsConfig::default()
        };
        assert!(matches!(TlsMaterial::load(&cfg, false), Err(LinkError::Tls(_))));
    }

    #[test]
    fn test_mqtt_transport_selection() {
        let empty = TlsMaterial::default();
        assert!(matches!(empty.mqtt_transport(false), Ok(rumqttc::Transport::Tcp)));

        let identity_only = TlsMaterial {
            identity: Some((b"cert".to_vec(), b"key".to_vec())),
            ..TlsMaterial::default()
        };
        assert!(matches!(identity_only.mqtt_transport(false), Err(LinkError::Tls(_))));

        let insecure = TlsMaterial {
            insecure_skip_verify: true,
            ..TlsMaterial::default()
        };
        assert!(matches!(insecure.mqtt_transport(true), Err(LinkError::Tls(_))));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let cfg = TlsConfig {
            ca: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsConfig::default()
        };
        let err = TlsMaterial::load(&cfg, false).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
