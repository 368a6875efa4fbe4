//! 音声コマンドの語彙
//!
//! 正規化した発話に語句が部分一致するかだけを見る。フェーズごとに
//! 受け付けるコマンドを並べ、最初に一致したものを採る。

use crate::games::matcher::normalize;
use crate::games::{GameKind, GameMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Continue,
    Login,
    Register,
    Play,
    Settings,
    Progress,
    Logout,
    Exit,
    Back,
    ChangeName,
    ChangeLanguage,
    Mode(GameMode),
    Game(GameKind),
    Again,
}

/// 語句はアクセントなし・小文字で書く
#[rustfmt::skip]
fn phrases(command: Command) -> &'static [&'static str] {
    match command {
        Command::Continue       => &["continuar", "empezar", "comenzar", "continue", "start"],
        Command::Login          => &["iniciar sesion", "iniciar", "entrar", "log in", "login"],
        Command::Register       => &["registrarme", "registrar", "crear cuenta", "register", "sign up"],
        Command::Play           => &["jugar", "juegos", "juego", "play"],
        Command::Settings       => &["configuracion", "configurar", "ajustes", "cuenta", "settings"],
        Command::Progress       => &["progreso", "estadisticas", "resultados", "progress"],
        Command::Logout         => &["cerrar sesion", "logout", "log out"],
        Command::Exit           => &["salir", "adios", "exit", "quit"],
        Command::Back           => &["volver", "atras", "menu", "terminar", "back"],
        Command::ChangeName     => &["nombre", "name"],
        Command::ChangeLanguage => &["idioma", "lengua", "language"],
        Command::Mode(GameMode::Training)   => &["entrenamiento", "entrenar", "practica", "training"],
        Command::Mode(GameMode::Evaluation) => &["evaluacion", "evaluar", "examen", "evaluation"],
        Command::Game(GameKind::Discover)   => &["descubre", "descubrir", "nombra", "discover"],
        Command::Game(GameKind::FindFruits) => &["frutas", "encuentra", "buscar", "fruits"],
        Command::Game(GameKind::Categorize) => &["categorias", "clasifica", "clasificar", "categorize"],
        Command::Game(GameKind::Memory)     => &["memoria", "secuencia", "memory"],
        Command::Again          => &["otra vez", "repetir", "nuevo", "again"],
    }
}

/// 許可されたコマンドのうち最初に一致したもの
pub fn parse(text: &str, allowed: &[Command]) -> Option<Command> {
    let norm = normalize(text);
    if norm.is_empty() {
        return None;
    }
    allowed
        .iter()
        .copied()
        .find(|c| phrases(*c).iter().any(|p| contains_phrase(&norm, p)))
}

/// 語の境界で一致するか（"nombre" が "renombrar" に当たらないように）
fn contains_phrase(norm: &str, phrase: &str) -> bool {
    let padded = format!(" {} ", norm);
    padded.contains(&format!(" {} ", phrase))
}

/// どのフェーズでもコマンドとして解釈されうる語句か（登録名の予約語チェック）
pub fn is_reserved(text: &str) -> bool {
    let norm = normalize(text);
    ALL.iter().any(|c| phrases(*c).iter().any(|p| contains_phrase(&norm, p)))
}

const ALL: &[Command] = &[
    Command::Continue,
    Command::Login,
    Command::Register,
    Command::Play,
    Command::Settings,
    Command::Progress,
    Command::Logout,
    Command::Exit,
    Command::Back,
    Command::Mode(GameMode::Training),
    Command::Mode(GameMode::Evaluation),
    Command::Again,
];

/// "español" / "inglés" などを言語コードに
pub fn parse_language(text: &str) -> Option<&'static str> {
    #[rustfmt::skip]
    const LANGUAGES: &[(&str, &str)] = &[
        ("espanol", "es"), ("castellano", "es"), ("spanish", "es"),
        ("ingles", "en"), ("english", "en"),
    ];
    let norm = normalize(text);
    LANGUAGES
        .iter()
        .find(|(word, _)| contains_phrase(&norm, word))
        .map(|(_, code)| *code)
}

pub fn language_label(code: &str) -> &'static str {
    match code {
        "en" => "inglés",
        _ => "español",
    }
}
