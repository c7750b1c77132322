//! Utilitaires partagés par les crates PMOSpot.
//!
//! - [`is_loopback_peer`] : filtre des clients autorisés à se connecter au serveur de flux
//! - [`human_bytes`] : formatage des tailles pour les journaux
//! - [`find_process_using_port`] : diagnostic quand le port d'écoute est déjà pris
mod net;
mod process;

pub use net::{guess_local_ip, is_loopback_peer};
pub use process::{ProcessPortInfo, TransportProtocol, find_process_using_port};

/// Formate une taille en octets pour un humain.
///
/// `0` donne `"0 Bytes"`, les valeurs inférieures à 1024 restent en octets, puis
/// KB, MB et GB avec deux décimales (base 1024).
///
/// # Exemples
///
/// ```
/// use pmoutils::human_bytes;
///
/// assert_eq!(human_bytes(0), "0 Bytes");
/// assert_eq!(human_bytes(512), "512 Bytes");
/// assert_eq!(human_bytes(2_880_000), "2.75 MB");
/// ```
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = bytes as f64;
    if bytes == 0 {
        "0 Bytes".to_string()
    } else if value < KB {
        format!("{} Bytes", bytes)
    } else if value < MB {
        format!("{:.2} KB", value / KB)
    } else if value < GB {
        format!("{:.2} MB", value / MB)
    } else {
        format!("{:.2} GB", value / GB)
    }
}
