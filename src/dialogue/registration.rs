//! 登録名の検証

use thiserror::Error;

use super::vocabulary;
use crate::games::matcher::normalize;
use crate::store::UserStore;

pub const MIN_NAME_LEN: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name too short")]
    TooShort,

    #[error("reserved word: {0}")]
    Reserved(String),

    #[error("name already taken: {0}")]
    Duplicate(String),
}

impl NameError {
    /// 画面に出す文言
    pub fn message(&self) -> String {
        match self {
            NameError::TooShort => "Nombre demasiado corto. Intenta de nuevo.".to_string(),
            NameError::Reserved(name) => format!("'{}' no puede ser un nombre. Di otro nombre.", name),
            NameError::Duplicate(name) => format!("El nombre '{}' ya existe. Di otro nombre.", name),
        }
    }
}

const PREFIXES: &[&str] = &["me llamo ", "mi nombre es ", "soy ", "my name is "];

/// 発話から表示用の名前を取り出す（前置きを外して各語の先頭を大文字に）
pub fn clean_name(text: &str) -> String {
    let mut rest = text.trim();
    let lower = rest.to_lowercase();
    for prefix in PREFIXES {
        if lower.starts_with(prefix) && rest.is_char_boundary(prefix.len()) {
            rest = rest[prefix.len()..].trim();
            break;
        }
    }
    rest.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// 長さ・予約語・重複を確かめ、通れば表示用の名前を返す。
/// `current` は改名時の自分自身の名前（自分とは重複扱いしない）。
pub fn validate_name(text: &str, store: &dyn UserStore, current: Option<&str>) -> Result<String, NameError> {
    let name = clean_name(text);
    let key = normalize(&name);
    if key.chars().filter(|c| !c.is_whitespace()).count() < MIN_NAME_LEN {
        return Err(NameError::TooShort);
    }
    if vocabulary::is_reserved(&name) {
        return Err(NameError::Reserved(name));
    }
    let is_self = current.is_some_and(|c| normalize(c) == key);
    let taken = store.exists(&name) || store.profiles().iter().any(|p| normalize(&p.name) == key);
    if taken && !is_self {
        return Err(NameError::Duplicate(name));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonUserStore;

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("  ana  "), "Ana");
        assert_eq!(clean_name("me llamo maría josé"), "María José");
        assert_eq!(clean_name("Soy LUIS"), "Luis");
    }

    #[test]
    fn test_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonUserStore::open(dir.path().join("u.json")).unwrap();
        store.register("Álvaro", "es", None).unwrap();

        assert_eq!(validate_name("a", &store, None), Err(NameError::TooShort));
        assert!(matches!(validate_name("registrarme", &store, None), Err(NameError::Reserved(_))));
        assert!(
            matches!(validate_name("alvaro", &store, None), Err(NameError::Duplicate(_))),
            "accent and case insensitive"
        );
        assert_eq!(validate_name("alvaro", &store, Some("Álvaro")), Ok("Alvaro".to_string()));
        assert_eq!(validate_name("ana", &store, None), Ok("Ana".to_string()));
    }
}
