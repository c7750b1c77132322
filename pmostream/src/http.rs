//! Analyse de la requête et réponses HTTP minimales
//!
//! Seul ce dont le handler a besoin : ligne de requête, en-têtes dans une table
//! sensible à la casse, réponse `200` à longueur fixe et `403` sans corps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{Result, StreamError};
use crate::lookup::TOKEN_LEN;

pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
pub const SERVER_NAME: &str = "SpotifyResolver";
pub const CONTENT_TYPE: &str = "audio/mpeg";

/// Ligne de requête et en-têtes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Méthode en majuscules
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
}

impl RequestHead {
    /// Nom de produit du client : le texte de `User-Agent` avant le premier `/`
    pub fn agent(&self) -> Option<&str> {
        let value = self
            .headers
            .get("User-Agent")
            .or_else(|| self.headers.get("user-agent"))?;
        let product = value.split('/').next().unwrap_or(value).trim();
        (!product.is_empty()).then_some(product)
    }
}

/// Position de la fin des en-têtes (après la ligne vide), si elle est arrivée
pub fn head_end(buf: &[u8]) -> Option<usize> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(pos + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

pub fn parse_request(raw: &str) -> Result<RequestHead> {
    let mut lines = raw.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| StreamError::rejected("empty request"))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
        return Err(StreamError::rejected(format!(
            "malformed request line {request_line:?}"
        )));
    };
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(RequestHead {
        method: method.to_uppercase(),
        path: path.to_string(),
        version,
        headers,
    })
}

/// Extrait le jeton d'un chemin `<base_path><36 caractères>`
pub fn extract_token<'a>(path: &'a str, base_path: &str) -> Result<&'a str> {
    if path.len() != base_path.len() + TOKEN_LEN {
        return Err(StreamError::rejected(format!(
            "path {path:?} has length {}, expected {}",
            path.len(),
            base_path.len() + TOKEN_LEN
        )));
    }
    path.strip_prefix(base_path)
        .ok_or_else(|| StreamError::rejected(format!("path {path:?} outside {base_path:?}")))
}

/// En-tête de réponse `200 OK` pour un corps de `content_length` octets
pub fn ok_header(content_length: u64, now: DateTime<Utc>) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Date: {}\r\n\
         Server: {SERVER_NAME}\r\n\
         Content-Type: {CONTENT_TYPE}\r\n\
         Content-Length: {content_length}\r\n\
         Keep-Alive: timeout=1, max=1\r\n\
         Connection: Keep-Alive\r\n\
         \r\n",
        now.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}
