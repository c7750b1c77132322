//! Préparation des requêtes et score des résultats

use pmostream::Track;

use crate::messages::Query;

/// Ne garde que `A-Z`, `a-z` et `0-9` ; tout le reste devient un espace unique
pub fn filter_query(raw: &str) -> String {
    let mut filtered = String::with_capacity(raw.len());
    let mut last = ' ';
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { ' ' };
        if c != ' ' || last != ' ' {
            filtered.push(c);
        }
        last = c;
    }
    filtered.trim().to_string()
}

/// Chaîne de recherche `artist track [album]`, filtrée
pub fn build_query(artist: &str, track: &str, album: Option<&str>) -> String {
    let mut raw = format!("{artist} {track}");
    if let Some(album) = album {
        raw.push(' ');
        raw.push_str(album);
    }
    filter_query(&raw)
}

/// Code Soundex sur 4 caractères
///
/// La première lettre est conservée telle quelle (en majuscule). Une chaîne
/// vide donne `"0000"`.
pub fn soundex(word: &str) -> String {
    let upper = word.to_uppercase();
    let mut chars = upper.chars();
    let Some(first) = chars.next() else {
        return "0000".to_string();
    };

    let mut code = String::with_capacity(8);
    code.push(first);
    let mut last = first;
    for c in chars {
        let mapped = soundex_class(c);
        if mapped != last && mapped != 'A' && mapped != 'S' && mapped != ' ' {
            code.push(mapped);
            last = mapped;
        }
    }

    code.push_str("0000");
    code.chars().take(4).collect()
}

fn soundex_class(c: char) -> char {
    match c {
        'A' | 'E' | 'I' | 'O' | 'U' | 'Y' => 'A',
        'H' | 'W' => 'S',
        'B' | 'F' | 'P' | 'V' => '1',
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => '2',
        'D' | 'T' => '3',
        'L' => '4',
        'M' | 'N' => '5',
        'R' => '6',
        _ => ' ',
    }
}

/// Similarité de deux chaînes déjà en minuscules, entre 0 et 1
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b || soundex(a) == soundex(b) {
        1.0
    } else if !b.is_empty() && a.contains(b) {
        b.len() as f64 / a.len() as f64
    } else if !a.is_empty() && b.contains(a) {
        a.len() as f64 / b.len() as f64
    } else {
        0.0
    }
}

/// Moyenne des similarités artiste, titre et album
///
/// L'album compte pour 1 quand la requête n'en précise pas. Seul le premier
/// artiste de la piste est comparé.
pub fn score(track: &Track, query: &Query) -> f64 {
    let artist = track.artists.first().map(String::as_str).unwrap_or_default();
    let artist_score = similarity(&query.artist.to_lowercase(), &artist.to_lowercase());
    let track_score = similarity(&query.track.to_lowercase(), &track.name.to_lowercase());
    let album_score = match query.album() {
        Some(album) => similarity(&album.to_lowercase(), &track.album.to_lowercase()),
        None => 1.0,
    };
    (artist_score + track_score + album_score) / 3.0
}
