//! Trust anchor: one self-signed CA-capable certificate, generated on
//! first start, persisted under the local application data directory and
//! installed into the OS root trust store.

use std::path::{Path, PathBuf};
use std::process::Command;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha1::{Digest, Sha1};
use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

const CERT_FILE: &str = "ca.der";
const CERT_PEM_FILE: &str = "ca.pem";
const KEY_FILE: &str = "ca.key.der";

const COMMON_NAME: &str = "rai-connect local";
const VALIDITY_DAYS: i64 = 3650;

/// Certificates this close to expiry are replaced on start.
const RENEWAL_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("no local data directory available")]
    DataDir,
    #[error("permission denied updating the system trust store: {0}")]
    PermissionDenied(String),
    #[error("trust store command failed: {0}")]
    CommandFailed(String),
    #[error("platform not supported for trust store management")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

/// In-memory certificate + key, shared read-only across the proxy.
pub struct CertificateBundle {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    /// PEM copy on disk, handed to the platform trust tools.
    pub cert_pem_path: PathBuf,
    /// Uppercase hex SHA-1 of the DER certificate; trust-store removal
    /// matches on this, never on a name.
    pub fingerprint: String,
}

/// Stable location for the bundle files.
pub fn data_dir() -> Result<PathBuf, TrustError> {
    dirs::data_local_dir()
        .map(|dir| dir.join("rai-connect"))
        .ok_or(TrustError::DataDir)
}

/// Loads the persisted bundle if all of its files exist.
pub fn load(dir: &Path) -> Result<Option<CertificateBundle>, TrustError> {
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);
    let pem_path = dir.join(CERT_PEM_FILE);
    if !cert_path.exists() || !key_path.exists() || !pem_path.exists() {
        return Ok(None);
    }

    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;
    let fingerprint = fingerprint_sha1(&cert);

    Ok(Some(CertificateBundle {
        cert_der: CertificateDer::from(cert),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)),
        cert_pem_path: pem_path,
        fingerprint,
    }))
}

/// Returns the persisted bundle, generating a fresh one when it is absent,
/// near expiry, mismatched with its key, or missing a required SAN.
pub fn ensure(dir: &Path, domains: &[String]) -> Result<CertificateBundle, TrustError> {
    std::fs::create_dir_all(dir)?;

    if let Some(bundle) = load(dir)? {
        if bundle_is_current(&bundle, domains) {
            tracing::debug!(fingerprint = %bundle.fingerprint, "reusing persisted certificate");
            return Ok(bundle);
        }
        tracing::info!("persisted certificate is stale, regenerating");
    }

    generate(dir, domains)
}

fn bundle_is_current(bundle: &CertificateBundle, domains: &[String]) -> bool {
    let Ok((_, cert)) = X509Certificate::from_der(bundle.cert_der.as_ref()) else {
        return false;
    };

    let not_after = cert.validity().not_after.timestamp();
    let renewal_floor = OffsetDateTime::now_utc().unix_timestamp() + RENEWAL_WINDOW_DAYS * 86_400;
    if not_after < renewal_floor {
        return false;
    }

    // The stored key must still be the one the certificate was built from.
    let key_bytes = match &bundle.key_der {
        PrivateKeyDer::Pkcs8(key) => key.secret_pkcs8_der(),
        _ => return false,
    };
    let Ok(key_pair) = KeyPair::try_from(key_bytes) else {
        return false;
    };
    if cert.public_key().raw != key_pair.public_key_der() {
        return false;
    }

    let sans: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                GeneralName::IPAddress(_) => None,
                _ => None,
            })
            .collect(),
        _ => return false,
    };
    domains
        .iter()
        .filter(|d| d.parse::<std::net::IpAddr>().is_err())
        .all(|d| sans.contains(&d.to_ascii_lowercase()))
}

fn generate(dir: &Path, domains: &[String]) -> Result<CertificateBundle, TrustError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| TrustError::Generation(e.to_string()))?;

    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|e| TrustError::Generation(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::CommonName, COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TrustError::Generation(e.to_string()))?;

    let cert_der = cert.der().to_vec();
    let key_der = key_pair.serialize_der();
    let pem_path = dir.join(CERT_PEM_FILE);

    std::fs::write(dir.join(CERT_FILE), &cert_der)?;
    std::fs::write(dir.join(KEY_FILE), &key_der)?;
    std::fs::write(&pem_path, cert.pem())?;

    let fingerprint = fingerprint_sha1(&cert_der);
    tracing::info!(fingerprint = %fingerprint, domains = domains.len(), "generated trust anchor");

    Ok(CertificateBundle {
        cert_der: CertificateDer::from(cert_der),
        key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
        cert_pem_path: pem_path,
        fingerprint,
    })
}

fn fingerprint_sha1(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

/// Adds the certificate to the OS root trust store. Installing a
/// certificate that is already present is a no-op, not an error.
pub fn install_to_system_trust(bundle: &CertificateBundle) -> Result<InstallOutcome, TrustError> {
    #[cfg(target_os = "windows")]
    return install_windows(bundle);

    #[cfg(target_os = "macos")]
    return install_macos(bundle);

    #[cfg(target_os = "linux")]
    return install_linux(bundle);

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    Err(TrustError::Unsupported)
}

/// Removes the certificate, matched by fingerprint only.
pub fn uninstall_from_system_trust(bundle: &CertificateBundle) -> Result<(), TrustError> {
    #[cfg(target_os = "windows")]
    return uninstall_windows(bundle);

    #[cfg(target_os = "macos")]
    return uninstall_macos(bundle);

    #[cfg(target_os = "linux")]
    return uninstall_linux(bundle);

    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    Err(TrustError::Unsupported)
}

#[cfg(target_os = "windows")]
fn install_windows(bundle: &CertificateBundle) -> Result<InstallOutcome, TrustError> {
    // Probe by thumbprint first so a re-install stays a no-op.
    if run_cmd("certutil", &["-verifystore", "Root", &bundle.fingerprint]).is_ok() {
        return Ok(InstallOutcome::AlreadyPresent);
    }

    let path = path_arg(&bundle.cert_pem_path);
    run_cmd("certutil", &["-addstore", "Root", &path])?;
    Ok(InstallOutcome::Installed)
}

#[cfg(target_os = "windows")]
fn uninstall_windows(bundle: &CertificateBundle) -> Result<(), TrustError> {
    if run_cmd("certutil", &["-verifystore", "Root", &bundle.fingerprint]).is_err() {
        return Ok(());
    }
    run_cmd("certutil", &["-delstore", "Root", &bundle.fingerprint])?;
    Ok(())
}

#[cfg(target_os = "macos")]
const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

#[cfg(target_os = "macos")]
fn install_macos(bundle: &CertificateBundle) -> Result<InstallOutcome, TrustError> {
    if macos_is_present(bundle)? {
        return Ok(InstallOutcome::AlreadyPresent);
    }

    let path = path_arg(&bundle.cert_pem_path);
    run_cmd(
        "security",
        &[
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            SYSTEM_KEYCHAIN,
            &path,
        ],
    )?;
    Ok(InstallOutcome::Installed)
}

#[cfg(target_os = "macos")]
fn uninstall_macos(bundle: &CertificateBundle) -> Result<(), TrustError> {
    if !macos_is_present(bundle)? {
        return Ok(());
    }
    run_cmd(
        "security",
        &[
            "delete-certificate",
            "-Z",
            &bundle.fingerprint,
            SYSTEM_KEYCHAIN,
        ],
    )?;
    Ok(())
}

#[cfg(target_os = "macos")]
fn macos_is_present(bundle: &CertificateBundle) -> Result<bool, TrustError> {
    let output = Command::new("security")
        .args(["find-certificate", "-a", "-Z", SYSTEM_KEYCHAIN])
        .output()
        .map_err(|e| TrustError::CommandFailed(format!("security: {}", e)))?;
    if !output.status.success() {
        return Err(classify_failure("security", &output));
    }
    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(listing.contains(&bundle.fingerprint))
}

#[cfg(target_os = "linux")]
const LINUX_CERT_PATH: &str = "/usr/local/share/ca-certificates/rai-connect.crt";

#[cfg(target_os = "linux")]
fn install_linux(bundle: &CertificateBundle) -> Result<InstallOutcome, TrustError> {
    let pem = std::fs::read(&bundle.cert_pem_path)?;
    if let Ok(existing) = std::fs::read(LINUX_CERT_PATH) {
        if existing == pem {
            return Ok(InstallOutcome::AlreadyPresent);
        }
    }

    std::fs::write(LINUX_CERT_PATH, &pem).map_err(map_io_permission)?;
    run_cmd("update-ca-certificates", &[])?;
    Ok(InstallOutcome::Installed)
}

#[cfg(target_os = "linux")]
fn uninstall_linux(_bundle: &CertificateBundle) -> Result<(), TrustError> {
    match std::fs::remove_file(LINUX_CERT_PATH) {
        Ok(()) => {
            run_cmd("update-ca-certificates", &["--fresh"])?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(map_io_permission(e)),
    }
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn run_cmd(program: &str, args: &[&str]) -> Result<(), TrustError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| TrustError::CommandFailed(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        return Err(classify_failure(program, &output));
    }
    Ok(())
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn classify_failure(program: &str, output: &std::process::Output) -> TrustError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    let detail = format!("{} exited with {}: {}", program, output.status, message);

    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("denied") || lowered.contains("authorization") || lowered.contains("privilege")
    {
        TrustError::PermissionDenied(detail)
    } else {
        TrustError::CommandFailed(detail)
    }
}

#[cfg(any(target_os = "windows", target_os = "macos"))]
fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(target_os = "linux")]
fn map_io_permission(e: std::io::Error) -> TrustError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        TrustError::PermissionDenied(e.to_string())
    } else {
        TrustError::Io(e)
    }
}
