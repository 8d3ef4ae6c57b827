//! 連線建立：DNS 解析、TCP、TLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ConnectionError;
use crate::config::Server;

/// TCP keepalive 間隔，避免閒置時被伺服器或 NAT 踢掉
pub const KEEPALIVE: Duration = Duration::from_secs(15 * 60);

pub type ServerReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ServerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 解析主機名稱，取第一個位址
pub async fn resolve(server: &Server) -> Result<SocketAddr, ConnectionError> {
    let addr = server.address();
    debug!("解析 {}", addr);
    let resolved = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| ConnectionError::Resolve {
            addr: addr.clone(),
            message: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ConnectionError::Resolve {
            addr: addr.clone(),
            message: "沒有任何位址".to_string(),
        })?;
    debug!("{} 解析為 {}", addr, resolved);
    Ok(resolved)
}

/// 撥接並在需要時升級為 TLS，回傳讀寫兩半
pub async fn dial(
    addr: SocketAddr,
    server: &Server,
) -> Result<(ServerReader, ServerWriter), ConnectionError> {
    let limit = Duration::from_secs(server.connect_timeout_secs);
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::Timeout {
            addr,
            secs: server.connect_timeout_secs,
        })?
        .map_err(|source| ConnectionError::Dial { addr, source })?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("無法設定 TCP_NODELAY: {}", e);
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        warn!("無法設定 keepalive，閒置時可能被斷線: {}", e);
    }
    debug!("已連線到 {}", addr);

    if !server.ssl {
        let (reader, writer) = stream.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    }

    let config = if server.insecure {
        debug!("TLS: 不驗證憑證");
        insecure_tls_config()
    } else {
        default_tls_config()
    };
    let server_name = rustls::pki_types::ServerName::try_from(server.host.clone())
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
        .map_err(|e| ConnectionError::Tls(e.to_string()))?;
    debug!("TLS 交握完成 {}", addr);

    let (reader, writer) = tokio::io::split(tls);
    Ok((Box::new(reader), Box::new(writer)))
}

fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn default_tls_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn insecure_tls_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// 接受任何憑證（自簽憑證的伺服器）
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}
