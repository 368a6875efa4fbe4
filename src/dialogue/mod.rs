//! 顔ログイン・登録・メニュー・ミニゲームをつなぐ対話の状態機械

pub mod machine;
pub mod phase;
pub mod registration;
pub mod session;
pub mod vocabulary;

pub use machine::{DialogueSettings, DialogueStateMachine};
pub use phase::{AccountStep, Phase};
pub use session::{Banner, SessionState};
