use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Indique si le pair d'une connexion est la boucle locale IPv4 `127.0.0.1`.
///
/// Seule cette adresse exacte est acceptée : `::1`, `127.0.0.2` ou une adresse
/// IPv4 encapsulée en IPv6 (`::ffff:127.0.0.1`) sont considérées comme distantes,
/// à l'exception de la dernière qui est normalisée avant comparaison.
///
/// # Examples
///
/// ```
/// use pmoutils::is_loopback_peer;
///
/// assert!(is_loopback_peer(&"127.0.0.1:5000".parse().unwrap()));
/// assert!(!is_loopback_peer(&"192.168.1.10:5000".parse().unwrap()));
/// ```
pub fn is_loopback_peer(peer: &SocketAddr) -> bool {
    let ip = match peer.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4,
            None => return false,
        },
    };
    ip == Ipv4Addr::LOCALHOST
}

/// Devine l'adresse IP locale de la machine.
///
/// Crée un socket UDP « connecté » vers un serveur DNS public pour demander au
/// système quelle interface serait utilisée. Aucun paquet n'est émis.
/// Retourne `"127.0.0.1"` en cas d'échec.
pub fn guess_local_ip() -> String {
    match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local_addr) = socket.local_addr() {
                    return local_addr.ip().to_string();
                }
            }
            "127.0.0.1".to_string()
        }
        Err(_) => "127.0.0.1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_loopback_is_accepted() {
        assert!(is_loopback_peer(&"127.0.0.1:60218".parse().unwrap()));
        assert!(is_loopback_peer(&"[::ffff:127.0.0.1]:1".parse().unwrap()));
        assert!(!is_loopback_peer(&"127.0.0.2:1".parse().unwrap()));
        assert!(!is_loopback_peer(&"[::1]:1".parse().unwrap()));
        assert!(!is_loopback_peer(&"10.0.0.5:80".parse().unwrap()));
    }

    #[test]
    fn test_guess_local_ip_is_parseable() {
        let ip = guess_local_ip();
        assert!(ip.parse::<IpAddr>().is_ok());
    }
}
