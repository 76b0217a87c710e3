use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as WireTransport};
use tracing::{debug, info, warn};

use super::session::SessionError;

/// Certificate material for mutual TLS. Paths point at PEM files.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlsCredentials {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub root_ca: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MqttConfig {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub tls: bool,
    pub credentials: TlsCredentials,
    pub keep_alive: Duration,
    /// Always false for garden clients: the broker keeps our subscriptions across reconnects.
    pub clean_session: bool,
    /// `None` waits for the broker indefinitely.
    pub connect_timeout: Option<Duration>,
    pub reconnect: BackoffSettings,
    pub channel_capacity: usize,
}

impl MqttConfig {
    pub async fn mqtt_options(&self) -> Result<MqttOptions, SessionError> {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.endpoint.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(self.clean_session);

        if self.tls {
            options.set_transport(self.tls_transport().await?);
        } else {
            info!(
                "TLS disabled, connecting to {}:{} over plain TCP",
                self.endpoint, self.port
            );
        }

        Ok(options)
    }

    async fn tls_transport(&self) -> Result<WireTransport, SessionError> {
        let client_auth = match (&self.credentials.cert, &self.credentials.key) {
            (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
            (None, None) => None,
            (Some(_), None) => {
                return Err(SessionError::TlsConfig(
                    "client certificate given without a private key".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(SessionError::TlsConfig(
                    "private key given without a client certificate".to_string(),
                ))
            }
        };

        match &self.credentials.root_ca {
            Some(root_ca) => {
                let ca = read_pem(root_ca).await?;
                debug!(
                    "Using trust root {} (client auth: {})",
                    root_ca.display(),
                    client_auth.is_some()
                );
                Ok(WireTransport::tls(ca, client_auth, None))
            }
            None => match client_auth {
                Some((cert, key)) => {
                    debug!("No trust root given, client auth against the platform trust store");
                    native_roots_with_client_auth(&cert, &key)
                }
                None => {
                    debug!("No trust root given, using the platform trust store");
                    Ok(WireTransport::tls_with_default_config())
                }
            },
        }
    }
}

/// Mutual TLS trusting the platform's root certificates.
fn native_roots_with_client_auth(
    cert: &[u8],
    key: &[u8],
) -> Result<WireTransport, SessionError> {
    let chain = rustls_pemfile::certs(&mut &cert[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SessionError::TlsConfig(format!("unreadable client certificate: {e}")))?;
    if chain.is_empty() {
        return Err(SessionError::TlsConfig(
            "no certificate found in the client certificate file".to_string(),
        ));
    }
    let key = rustls_pemfile::private_key(&mut &key[..])
        .map_err(|e| SessionError::TlsConfig(format!("unreadable private key: {e}")))?
        .ok_or_else(|| {
            SessionError::TlsConfig("no private key found in the key file".to_string())
        })?;

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .map_err(|e| SessionError::TlsConfig(format!("platform trust store: {e}")))?;
    let (added, ignored) = roots.add_parsable_certificates(native);
    if ignored > 0 {
        warn!("Skipped {} unparsable platform root certificates", ignored);
    }
    if added == 0 {
        return Err(SessionError::TlsConfig(
            "platform trust store holds no usable root certificates".to_string(),
        ));
    }
    debug!("Loaded {} platform root certificates", added);

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| SessionError::TlsConfig(format!("client certificate rejected: {e}")))?;
    Ok(WireTransport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(config),
    )))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, SessionError> {
    tokio::fs::read(path)
        .await
        .map_err(|source| SessionError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })
}
