//! 対話の状態機械
//!
//! 描画ループから毎フレーム `tick` を呼ぶ。音声スレッドが置いた発話は
//! `VoiceLink` から1件ずつ取り出して処理する。フェーズの変更は必ず
//! `replace_phase` を通り、そこで聞き取りを止めて epoch を進める。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::phase::{AccountStep, Phase};
use super::registration::{validate_name, NameError};
use super::session::SessionState;
use super::vocabulary::{language_label, parse, parse_language, Command};
use crate::catalog::Catalog;
use crate::config::{Config, GamesConfig, LoginConfig};
use crate::face::{best_match, FaceSample};
use crate::games::quorum::Deadline;
use crate::games::{GameKind, GameMode};
use crate::marker::MarkerId;
use crate::store::{StoreError, UserProfile, UserStore};
use crate::voice::{Announcer, VoiceLink};

/// 状態機械が使う設定
#[derive(Debug, Clone)]
pub struct DialogueSettings {
    pub login: LoginConfig,
    pub stable_frames: u32,
    pub mascot_marker: MarkerId,
    pub games: GamesConfig,
    pub intro_secs: f32,
    pub banner_frames: u32,
}

impl DialogueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            login: config.login.clone(),
            stable_frames: config.face.stable_frames.max(1),
            mascot_marker: config.markers.mascot_marker,
            games: config.games.clone(),
            intro_secs: 2.0,
            banner_frames: 90,
        }
    }
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct DialogueStateMachine {
    settings: DialogueSettings,
    catalog: Arc<Catalog>,
    store: Box<dyn UserStore>,
    announcer: Box<dyn Announcer>,
    link: Arc<VoiceLink>,
    rng: StdRng,
    session: SessionState,
}

impl DialogueStateMachine {
    pub fn new(
        settings: DialogueSettings,
        catalog: Arc<Catalog>,
        store: Box<dyn UserStore>,
        announcer: Box<dyn Announcer>,
        link: Arc<VoiceLink>,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        let intro = Phase::Intro { until: Deadline::after(now, settings.intro_secs) };
        let mut machine = Self {
            settings,
            catalog,
            store,
            announcer,
            link,
            rng,
            session: SessionState::new(intro),
        };
        machine.announcer.announce("¡Bienvenido al Mundo de Luminia!");
        machine.sync_listening();
        machine
    }

    pub fn phase(&self) -> &Phase {
        &self.session.phase
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn current_user(&self) -> Option<&UserProfile> {
        self.session.current_user.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.session.error_message.as_deref()
    }

    pub fn store(&self) -> &dyn UserStore {
        self.store.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.session.phase, Phase::Exit)
    }

    /// このフレームで顔検出を回す必要があるか
    pub fn wants_face(&self) -> bool {
        self.session.phase.wants_face()
    }

    /// 1フレーム分の更新
    pub fn tick(&mut self, now: Instant, visible: &BTreeSet<MarkerId>, face: Option<&FaceSample>) {
        if let Some(err) = self.link.take_error() {
            self.session.error_message = Some(err);
        }
        if let Some(text) = self.link.take_utterance() {
            self.handle_utterance(&text, now);
        }
        self.observe_face(face);
        self.advance(now, visible);
        self.session.tick_banner();
        self.sync_listening();
    }

    fn observe_face(&mut self, face: Option<&FaceSample>) {
        if !self.session.phase.wants_face() {
            return;
        }
        let embedding = face.and_then(|f| f.embedding.as_ref());
        if let Some(v) = embedding {
            self.session.facial_vector_current = Some(v.clone());
        }
        if let Phase::FaceRecognition { stable_frames } = &mut self.session.phase {
            *stable_frames = if embedding.is_some() { *stable_frames + 1 } else { 0 };
        }
    }

    /// 時間や視界で進む遷移
    fn advance(&mut self, now: Instant, visible: &BTreeSet<MarkerId>) {
        match &mut self.session.phase {
            Phase::Intro { until } => {
                if until.expired(now) {
                    self.set_phase(Phase::FaceRecognition { stable_frames: 0 });
                }
            }
            Phase::FaceRecognition { stable_frames } => {
                if *stable_frames >= self.settings.stable_frames {
                    self.set_phase(Phase::AwaitingCommand);
                }
            }
            Phase::TryingLogin => self.try_login(now),
            Phase::LoginFailed { until } => {
                if until.expired(now) {
                    self.set_phase(Phase::AwaitingCommand);
                }
            }
            Phase::Playing { game, .. } => {
                game.update(now, visible);
                if game.outcome().is_some() {
                    self.finish_game();
                }
            }
            _ => {}
        }
    }

    /// 認識された発話を1件処理する。処理中は聞き取りを止める。
    pub fn handle_utterance(&mut self, text: &str, now: Instant) {
        self.link.set_listening(false);
        self.session.error_message = None;
        debug!("[{}] utterance '{}'", self.session.phase.name(), text);

        match &mut self.session.phase {
            Phase::Intro { .. } => {
                if parse(text, &[Command::Continue]).is_some() {
                    self.set_phase(Phase::FaceRecognition { stable_frames: 0 });
                } else {
                    self.set_error("Di 'continuar' para seguir.");
                }
            }
            Phase::AwaitingCommand => self.on_command(text),
            Phase::AwaitingRegistrationName => self.on_registration_name(text),
            Phase::AwaitingRegistrationLanguage { name } => {
                let name = name.clone();
                self.on_registration_language(name, text);
            }
            Phase::MainMenu => self.on_main_menu(text),
            Phase::AccountSettings(step) => {
                let step = *step;
                self.on_account_settings(step, text);
            }
            Phase::Progress => {
                if parse(text, &[Command::Back, Command::Exit]).is_some() {
                    self.set_phase(Phase::MainMenu);
                } else {
                    self.set_error("Di 'volver' para regresar al menú.");
                }
            }
            Phase::ModeSelection => self.on_mode_selection(text),
            Phase::GameSelection { mode } => {
                let mode = *mode;
                self.on_game_selection(mode, text, now);
            }
            Phase::Playing { mode, game } => {
                if parse(text, &[Command::Exit]).is_some() {
                    let mode = *mode;
                    info!("game {} abandoned", game.kind().id());
                    self.set_phase(Phase::GameSelection { mode });
                } else {
                    game.handle_utterance(text, now);
                    if game.outcome().is_some() {
                        self.finish_game();
                    }
                }
            }
            Phase::Result { .. } => self.on_result(text, now),
            Phase::FaceRecognition { .. } | Phase::TryingLogin | Phase::LoginFailed { .. } | Phase::Exit => {
                debug!("utterance ignored in {}", self.session.phase.name());
            }
        }
        self.sync_listening();
    }

    fn on_command(&mut self, text: &str) {
        match parse(text, &[Command::Login, Command::Register, Command::Exit]) {
            Some(Command::Login) => self.set_phase(Phase::TryingLogin),
            Some(Command::Register) => self.set_phase(Phase::AwaitingRegistrationName),
            Some(Command::Exit) => self.set_phase(Phase::Exit),
            _ => self.set_error("Di 'iniciar sesión' o 'registrarme'."),
        }
    }

    fn try_login(&mut self, now: Instant) {
        let Some(vector) = self.session.facial_vector_current.clone() else {
            self.set_error("No se detectó la cara. Mira a la cámara.");
            self.set_phase(Phase::FaceRecognition { stable_frames: 0 });
            return;
        };
        let profiles = self.store.profiles();
        match best_match(&vector, &profiles, self.settings.login.threshold) {
            Some((profile, similarity)) => {
                info!("login: {} ({:.3})", profile.name, similarity);
                self.session.show_banner(format!("¡Hola, {}!", profile.name), self.settings.banner_frames);
                self.session.current_user = Some(profile.clone());
                self.set_phase(Phase::MainMenu);
            }
            None => {
                info!("login: no face match among {} profiles", profiles.len());
                self.set_error("Cara no registrada. Di 'registrarme' para crear cuenta.");
                let until = Deadline::after(now, self.settings.login.failed_cooldown_secs);
                self.set_phase(Phase::LoginFailed { until });
            }
        }
    }

    fn on_registration_name(&mut self, text: &str) {
        if parse(text, &[Command::Back]).is_some() {
            self.set_phase(Phase::AwaitingCommand);
            return;
        }
        match validate_name(text, self.store.as_ref(), None) {
            Ok(name) => {
                info!("registration name accepted: {}", name);
                self.set_phase(Phase::AwaitingRegistrationLanguage { name });
            }
            Err(e) => self.set_error(e.message()),
        }
    }

    fn on_registration_language(&mut self, name: String, text: &str) {
        let Some(language) = parse_language(text) else {
            self.set_error("Idioma no válido. Di 'español' o 'inglés'.");
            return;
        };
        let Some(vector) = self.session.facial_vector_current.clone() else {
            self.set_error("No se detectó la cara para registrar.");
            return;
        };
        match self.store.register(&name, language, Some(vector)) {
            Ok(profile) => {
                self.session
                    .show_banner(format!("¡Registro completado! Bienvenido, {}", profile.name), self.settings.banner_frames);
                self.session.current_user = Some(profile);
                self.set_phase(Phase::MainMenu);
            }
            Err(StoreError::DuplicateName(_)) => {
                self.set_error(NameError::Duplicate(name).message());
                self.set_phase(Phase::AwaitingRegistrationName);
            }
            Err(e) => {
                warn!("registration failed: {}", e);
                self.set_error("Error registrando usuario. Intenta de nuevo.");
            }
        }
    }

    fn on_main_menu(&mut self, text: &str) {
        let allowed = [Command::Logout, Command::Play, Command::Settings, Command::Progress, Command::Exit];
        match parse(text, &allowed) {
            Some(Command::Logout) => {
                if let Some(user) = self.session.current_user.take() {
                    info!("logout: {}", user.name);
                }
                self.set_phase(Phase::AwaitingCommand);
            }
            Some(Command::Play) => self.set_phase(Phase::ModeSelection),
            Some(Command::Settings) => self.set_phase(Phase::AccountSettings(AccountStep::Menu)),
            Some(Command::Progress) => self.set_phase(Phase::Progress),
            Some(Command::Exit) => self.set_phase(Phase::Exit),
            _ => self.set_error("Di 'jugar', 'progreso', 'configuración', 'cerrar sesión' o 'salir'."),
        }
    }

    fn on_account_settings(&mut self, step: AccountStep, text: &str) {
        let Some(current) = self.session.current_user.as_ref().map(|u| u.name.clone()) else {
            warn!("account settings without a user");
            self.set_phase(Phase::AwaitingCommand);
            return;
        };
        if parse(text, &[Command::Back]).is_some() {
            let back = match step {
                AccountStep::Menu => Phase::MainMenu,
                _ => Phase::AccountSettings(AccountStep::Menu),
            };
            self.set_phase(back);
            return;
        }
        match step {
            AccountStep::Menu => match parse(text, &[Command::ChangeName, Command::ChangeLanguage]) {
                Some(Command::ChangeName) => self.set_phase(Phase::AccountSettings(AccountStep::AwaitingName)),
                Some(Command::ChangeLanguage) => {
                    self.set_phase(Phase::AccountSettings(AccountStep::AwaitingLanguage))
                }
                _ => self.set_error("Di 'nombre', 'idioma' o 'volver'."),
            },
            AccountStep::AwaitingName => {
                let name = match validate_name(text, self.store.as_ref(), Some(&current)) {
                    Ok(name) => name,
                    Err(e) => return self.set_error(e.message()),
                };
                self.link.set_listening(false);
                match self.store.rename(&current, &name) {
                    Ok(profile) => {
                        self.session.show_banner(format!("Nombre cambiado a {}", profile.name), self.settings.banner_frames);
                        self.session.current_user = Some(profile);
                        self.set_phase(Phase::AccountSettings(AccountStep::Menu));
                    }
                    Err(StoreError::DuplicateName(_)) => self.set_error(NameError::Duplicate(name).message()),
                    Err(e) => {
                        warn!("rename failed: {}", e);
                        self.set_error("No se pudo guardar el cambio.");
                    }
                }
            }
            AccountStep::AwaitingLanguage => {
                let Some(language) = parse_language(text) else {
                    return self.set_error("Idioma no válido. Di 'español' o 'inglés'.");
                };
                self.link.set_listening(false);
                match self.store.set_language(&current, language) {
                    Ok(profile) => {
                        self.session.show_banner(
                            format!("Idioma cambiado a {}", language_label(language)),
                            self.settings.banner_frames,
                        );
                        self.session.current_user = Some(profile);
                        self.set_phase(Phase::AccountSettings(AccountStep::Menu));
                    }
                    Err(e) => {
                        warn!("language change failed: {}", e);
                        self.set_error("No se pudo guardar el cambio.");
                    }
                }
            }
        }
    }

    fn on_mode_selection(&mut self, text: &str) {
        let allowed = [
            Command::Mode(GameMode::Training),
            Command::Mode(GameMode::Evaluation),
            Command::Back,
        ];
        match parse(text, &allowed) {
            Some(Command::Mode(mode)) => self.set_phase(Phase::GameSelection { mode }),
            Some(_) => self.set_phase(Phase::MainMenu),
            None => self.set_error("Di 'entrenamiento' o 'evaluación'."),
        }
    }

    fn on_game_selection(&mut self, mode: GameMode, text: &str, now: Instant) {
        let allowed = [
            Command::Game(GameKind::Discover),
            Command::Game(GameKind::FindFruits),
            Command::Game(GameKind::Categorize),
            Command::Game(GameKind::Memory),
            Command::Back,
        ];
        match parse(text, &allowed) {
            Some(Command::Game(kind)) if kind.mode() == mode => self.start_game(mode, kind, now),
            Some(Command::Game(_)) => self.set_error("Ese juego no está en este modo."),
            Some(_) => self.set_phase(Phase::ModeSelection),
            None => {
                let names: Vec<&str> = mode.games().iter().map(|g| g.id()).collect();
                self.set_error(format!("Di {}.", names.join(" o ")));
            }
        }
    }

    fn start_game(&mut self, mode: GameMode, kind: GameKind, now: Instant) {
        let rng = StdRng::seed_from_u64(self.rng.gen());
        let game = kind.create(&self.settings.games, Arc::clone(&self.catalog), rng, now);
        info!("starting game {} ({})", kind.id(), mode.id());
        self.set_phase(Phase::Playing { mode, game });
    }

    /// 結果を保存して結果画面へ
    fn finish_game(&mut self) {
        let Phase::Playing { mode, game } = &self.session.phase else {
            return;
        };
        let Some(outcome) = game.outcome() else {
            return;
        };
        let (mode, kind, percent) = (*mode, game.kind(), outcome.percent());
        self.save_score(mode, kind, percent);
        self.replace_phase(|phase| match phase {
            Phase::Playing { mode, game } => Phase::Result { mode, game },
            other => other,
        });
    }

    fn save_score(&mut self, mode: GameMode, kind: GameKind, percent: f32) {
        let Some(name) = self.session.current_user.as_ref().map(|u| u.name.clone()) else {
            warn!("no user to record {} score", kind.id());
            return;
        };
        // 書き込み中に新しい発話を受けない
        self.link.set_listening(false);
        match self.store.record_game(&name, mode.id(), kind.id(), percent) {
            Ok(stats) => {
                info!(
                    "saved {}/{} for {}: last {:.0}% (mean {:.0}%, {} plays)",
                    mode.id(),
                    kind.id(),
                    name,
                    stats.last,
                    stats.mean,
                    stats.play_count
                );
                if let Some(profile) = self.store.get(&name) {
                    self.session.current_user = Some(profile);
                }
            }
            Err(e) => {
                warn!("failed to save score: {}", e);
                self.set_error("No se pudo guardar tu progreso.");
            }
        }
    }

    fn on_result(&mut self, text: &str, now: Instant) {
        match parse(text, &[Command::Again, Command::Back, Command::Exit]) {
            Some(Command::Again) => self.replace_phase(|phase| match phase {
                Phase::Result { mode, mut game } => {
                    game.restart(now);
                    Phase::Playing { mode, game }
                }
                other => other,
            }),
            Some(_) => {
                let Phase::Result { mode, .. } = &self.session.phase else { return };
                let mode = *mode;
                self.set_phase(Phase::GameSelection { mode });
            }
            None => self.set_error("Di 'otra vez' o 'salir'."),
        }
    }

    fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("error message: {}", message);
        self.session.error_message = Some(message);
    }

    fn set_phase(&mut self, next: Phase) {
        self.replace_phase(|_| next);
    }

    /// フェーズを差し替える唯一の経路
    fn replace_phase(&mut self, f: impl FnOnce(Phase) -> Phase) {
        let from = self.session.phase.name();
        let old = std::mem::replace(&mut self.session.phase, Phase::Exit);
        self.session.phase = f(old);
        let to = self.session.phase.name();
        info!("phase: {} -> {}", from, to);
        self.link.set_listening(false);
        self.link.advance_epoch();
        if let Some(prompt) = self.prompt() {
            self.announcer.announce(&prompt);
        }
    }

    fn wants_listening(&self) -> bool {
        match &self.session.phase {
            Phase::Playing { game, .. } => game.should_listen(),
            Phase::FaceRecognition { .. } | Phase::TryingLogin | Phase::LoginFailed { .. } | Phase::Exit => false,
            _ => true,
        }
    }

    fn sync_listening(&self) {
        self.link.set_long_window(self.session.phase.wants_long_window());
        self.link.set_listening(self.wants_listening());
    }

    /// フェーズに入ったときに読み上げる文
    fn prompt(&self) -> Option<String> {
        let text = match &self.session.phase {
            Phase::FaceRecognition { .. } => "Mira a la cámara".to_string(),
            Phase::AwaitingCommand => "Di 'iniciar sesión' o 'registrarme'".to_string(),
            Phase::LoginFailed { .. } => "Cara no registrada".to_string(),
            Phase::AwaitingRegistrationName => "¿Cómo te llamas?".to_string(),
            Phase::AwaitingRegistrationLanguage { name } => {
                format!("Hola, {}. ¿Qué idioma prefieres? Di español o inglés", name)
            }
            Phase::MainMenu => "Menú principal".to_string(),
            Phase::ModeSelection => "Elige modo: entrenamiento o evaluación".to_string(),
            Phase::Playing { game, .. } => game.kind().title().to_string(),
            Phase::Exit => "¡Hasta pronto!".to_string(),
            _ => return None,
        };
        Some(text)
    }

    /// このフレームで描画するマーカー。マスコットは見えていれば常に描く。
    pub fn markers_to_render(&self, visible: &BTreeSet<MarkerId>) -> Vec<MarkerId> {
        let mascot = self.settings.mascot_marker;
        let mut ids = Vec::new();
        if visible.contains(&mascot) {
            ids.push(mascot);
        }
        if let Phase::Playing { game, .. } = &self.session.phase {
            for id in game.render_markers(visible) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// 画面に重ねる文言
    pub fn display_lines(&self, now: Instant) -> Vec<String> {
        let user = self.session.current_user.as_ref().map(|u| u.name.as_str()).unwrap_or("");
        let mut lines: Vec<String> = match &self.session.phase {
            Phase::Intro { .. } => vec![
                "¡Bienvenido al Mundo de Luminia!".to_string(),
                "Di 'continuar' para empezar".to_string(),
            ],
            Phase::FaceRecognition { stable_frames } => vec![
                "Mira a la cámara".to_string(),
                format!("Detectando cara... {}/{}", stable_frames, self.settings.stable_frames),
            ],
            Phase::AwaitingCommand => vec!["Di 'iniciar sesión' o 'registrarme'".to_string()],
            Phase::TryingLogin => vec!["Comprobando tu cara...".to_string()],
            Phase::LoginFailed { .. } => vec!["Cara no registrada".to_string()],
            Phase::AwaitingRegistrationName => vec!["¿Cómo te llamas?".to_string()],
            Phase::AwaitingRegistrationLanguage { name } => vec![
                format!("Hola, {}", name),
                "¿Qué idioma prefieres? Di 'español' o 'inglés'".to_string(),
            ],
            Phase::MainMenu => vec![
                format!("Hola, {}", user),
                "Di: jugar, progreso, configuración, cerrar sesión o salir".to_string(),
            ],
            Phase::AccountSettings(AccountStep::Menu) => vec![
                "CONFIGURACIÓN DE LA CUENTA".to_string(),
                "Di 'nombre', 'idioma' o 'volver'".to_string(),
            ],
            Phase::AccountSettings(AccountStep::AwaitingName) => vec!["Di tu nuevo nombre".to_string()],
            Phase::AccountSettings(AccountStep::AwaitingLanguage) => {
                vec!["Di el nuevo idioma: español o inglés".to_string()]
            }
            Phase::Progress => self.progress_lines(),
            Phase::ModeSelection => vec!["Elige modo: entrenamiento o evaluación".to_string()],
            Phase::GameSelection { mode } => {
                let mut lines = vec![format!("Modo {}", mode.id())];
                lines.extend(mode.games().iter().map(|g| format!("- {} (di '{}')", g.title(), g.id())));
                lines
            }
            Phase::Playing { game, .. } => game.messages(now),
            Phase::Result { game, .. } => {
                let mut lines = game.messages(now);
                lines.push("Di 'otra vez' o 'salir'".to_string());
                lines
            }
            Phase::Exit => vec!["¡Hasta pronto!".to_string()],
        };
        if let Some(banner) = &self.session.banner {
            lines.push(banner.text.clone());
        }
        if let Some(err) = &self.session.error_message {
            lines.push(err.clone());
        }
        lines
    }

    fn progress_lines(&self) -> Vec<String> {
        let mut lines = vec!["TU PROGRESO".to_string()];
        let Some(user) = &self.session.current_user else {
            return lines;
        };
        for mode in [GameMode::Training, GameMode::Evaluation] {
            for kind in mode.games() {
                if let Some(s) = user.stats(mode.id(), kind.id()) {
                    lines.push(format!(
                        "{}: media {:.0}% | mejor {:.0}% | última {:.0}% | partidas {}",
                        kind.title(),
                        s.mean,
                        s.best,
                        s.last,
                        s.play_count
                    ));
                }
            }
        }
        if lines.len() == 1 {
            lines.push("Aún no has jugado".to_string());
        }
        lines.push("Di 'volver' para regresar".to_string());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GameStats;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// メモリ上のストア。`fail_writes` で書き込み失敗を再現する。
    #[derive(Default)]
    struct MemStore {
        users: BTreeMap<String, UserProfile>,
        fail_writes: bool,
    }

    impl MemStore {
        fn with(profiles: Vec<UserProfile>) -> Self {
            let users = profiles.into_iter().map(|p| (p.name.to_lowercase(), p)).collect();
            Self { users, fail_writes: false }
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail_writes {
                Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
            } else {
                Ok(())
            }
        }
    }

    impl UserStore for MemStore {
        fn register(&mut self, name: &str, language: &str, v: Option<Vec<f32>>) -> Result<UserProfile, StoreError> {
            self.check()?;
            if self.exists(name) {
                return Err(StoreError::DuplicateName(name.to_string()));
            }
            let p = UserProfile::new(name, language, v);
            self.users.insert(name.to_lowercase(), p.clone());
            Ok(p)
        }
        fn exists(&self, name: &str) -> bool {
            self.users.contains_key(&name.to_lowercase())
        }
        fn get(&self, name: &str) -> Option<UserProfile> {
            self.users.get(&name.to_lowercase()).cloned()
        }
        fn profiles(&self) -> Vec<UserProfile> {
            self.users.values().cloned().collect()
        }
        fn rename(&mut self, current: &str, new_name: &str) -> Result<UserProfile, StoreError> {
            self.check()?;
            let mut p = self.users.remove(&current.to_lowercase()).ok_or_else(|| StoreError::UnknownUser(current.into()))?;
            p.name = new_name.to_string();
            self.users.insert(new_name.to_lowercase(), p.clone());
            Ok(p)
        }
        fn set_language(&mut self, name: &str, language: &str) -> Result<UserProfile, StoreError> {
            self.check()?;
            let p = self.users.get_mut(&name.to_lowercase()).ok_or_else(|| StoreError::UnknownUser(name.into()))?;
            p.language = language.to_string();
            Ok(p.clone())
        }
        fn record_game(&mut self, name: &str, mode: &str, game: &str, score: f32) -> Result<GameStats, StoreError> {
            self.check()?;
            let p = self.users.get_mut(&name.to_lowercase()).ok_or_else(|| StoreError::UnknownUser(name.into()))?;
            let s = p.games_stats.entry(mode.into()).or_default().entry(game.into()).or_default();
            s.play_count += 1;
            s.last = score;
            s.best = s.best.max(score);
            s.mean = score;
            Ok(*s)
        }
    }

    struct Silent;
    impl Announcer for Silent {
        fn announce(&mut self, _text: &str) {}
    }

    /// (1, 0) と類似度 s の単位ベクトル
    fn at(s: f32) -> Vec<f32> {
        vec![s, (1.0 - s * s).sqrt()]
    }

    fn face(v: Vec<f32>) -> FaceSample {
        FaceSample {
            face: crate::face::FaceBox { x: 0, y: 0, width: 50, height: 50 },
            embedding: Some(v),
        }
    }

    fn none() -> BTreeSet<MarkerId> {
        BTreeSet::new()
    }

    fn machine(store: MemStore) -> (DialogueStateMachine, Arc<VoiceLink>, Instant) {
        let link = Arc::new(VoiceLink::new());
        let t0 = Instant::now();
        let m = DialogueStateMachine::new(
            DialogueSettings::default(),
            Arc::new(Catalog::default()),
            Box::new(store),
            Box::new(Silent),
            Arc::clone(&link),
            StdRng::seed_from_u64(42),
            t0,
        );
        (m, link, t0)
    }

    /// 顔が安定してコマンド待ちになるまで進める
    fn to_command(m: &mut DialogueStateMachine, t0: Instant, v: Vec<f32>) -> Instant {
        let t = t0 + Duration::from_secs(2);
        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "reconocimiento_facial");
        let sample = face(v);
        for _ in 0..5 {
            m.tick(t, &none(), Some(&sample));
        }
        assert_eq!(m.phase().name(), "esperando_comando");
        t
    }

    fn ana_store() -> MemStore {
        MemStore::with(vec![UserProfile::new("Ana", "es", Some(vec![1.0, 0.0]))])
    }

    #[test]
    fn test_login_success() {
        let (mut m, link, t0) = machine(ana_store());
        let t = to_command(&mut m, t0, at(0.95));
        assert!(link.is_listening(), "listening enabled once face is stable");

        m.handle_utterance("iniciar sesión", t);
        assert_eq!(m.phase().name(), "intentando_iniciar_sesion");
        assert!(!link.is_listening(), "no listening while login resolves");

        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "menu_principal");
        assert_eq!(m.current_user().map(|u| u.name.as_str()), Some("Ana"));
        assert!(link.is_listening());
    }

    #[test]
    fn test_login_below_threshold_fails() {
        let (mut m, _link, t0) = machine(ana_store());
        let t = to_command(&mut m, t0, at(0.80));
        m.handle_utterance("iniciar sesión", t);
        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "inicio_sesion_fallido");
        assert!(m.current_user().is_none());
        assert!(m.error_message().is_some());

        // クールダウン後にコマンド待ちへ戻る
        m.tick(t + Duration::from_secs(3), &none(), None);
        assert_eq!(m.phase().name(), "esperando_comando");
    }

    #[test]
    fn test_intro_continue_word() {
        let (mut m, _link, t0) = machine(MemStore::default());
        m.handle_utterance("hola", t0);
        assert_eq!(m.phase().name(), "inicio");
        m.handle_utterance("vamos a empezar", t0);
        assert_eq!(m.phase().name(), "reconocimiento_facial");
    }

    #[test]
    fn test_face_must_be_stable() {
        let (mut m, _link, t0) = machine(MemStore::default());
        let t = t0 + Duration::from_secs(2);
        m.tick(t, &none(), None);
        let sample = face(at(0.9));
        for _ in 0..4 {
            m.tick(t, &none(), Some(&sample));
        }
        m.tick(t, &none(), None);
        m.tick(t, &none(), Some(&sample));
        assert_eq!(m.phase().name(), "reconocimiento_facial", "lost face resets the count");
    }

    #[test]
    fn test_registration_flow() {
        let (mut m, link, t0) = machine(ana_store());
        let t = to_command(&mut m, t0, vec![0.0, 1.0]);

        // 音声スレッド経由の発話
        link.publish(link.epoch(), "registrarme");
        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "esperando_nombre_registro");
        assert!(link.wants_long_window());

        m.handle_utterance("ana", t);
        assert_eq!(m.phase().name(), "esperando_nombre_registro", "duplicate stays");
        assert!(m.error_message().is_some_and(|e| e.contains("ya existe")));

        m.handle_utterance("salir", t);
        assert_eq!(m.phase().name(), "esperando_nombre_registro", "reserved word");

        m.handle_utterance("luis", t);
        assert_eq!(m.phase().name(), "esperando_idioma_registro");

        m.handle_utterance("francés", t);
        assert_eq!(m.phase().name(), "esperando_idioma_registro");

        m.handle_utterance("español", t);
        assert_eq!(m.phase().name(), "menu_principal");
        let luis = m.store().get("luis").expect("registered");
        assert_eq!(luis.facial_vector, Some(vec![0.0, 1.0]));
        assert_eq!(m.current_user().map(|u| u.name.as_str()), Some("Luis"));
    }

    #[test]
    fn test_stale_utterance_dropped_on_transition() {
        let (mut m, link, t0) = machine(ana_store());
        let t = to_command(&mut m, t0, at(0.95));
        let epoch = link.epoch();
        m.handle_utterance("iniciar sesión", t);
        // 遷移前に聞き始めた発話
        assert!(!link.publish(epoch, "registrarme"));
        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "menu_principal");
    }

    fn logged_in(store: MemStore) -> (DialogueStateMachine, Arc<VoiceLink>, Instant) {
        let (mut m, link, t0) = machine(store);
        let t = to_command(&mut m, t0, at(0.99));
        m.handle_utterance("iniciar sesión", t);
        m.tick(t, &none(), None);
        assert_eq!(m.phase().name(), "menu_principal");
        (m, link, t)
    }

    fn play_discover(m: &mut DialogueStateMachine, t: Instant) -> Instant {
        m.handle_utterance("quiero jugar", t);
        assert_eq!(m.phase().name(), "seleccion_modo");
        m.handle_utterance("entrenamiento", t);
        assert_eq!(m.phase().name(), "seleccion_juego");
        m.handle_utterance("memoria", t);
        assert_eq!(m.phase().name(), "seleccion_juego", "memory is not a training game");
        m.handle_utterance("descubre", t);
        assert_eq!(m.phase().name(), "jugando");

        let pera: BTreeSet<MarkerId> = [0, 1].into_iter().collect();
        m.tick(t, &pera, None);
        assert_eq!(m.markers_to_render(&pera), vec![0, 1], "mascot plus scanned food");
        let t = t + Duration::from_secs(10);
        m.tick(t, &none(), None);
        m.tick(t, &pera, None);
        m.handle_utterance("es una pera", t);
        t
    }

    #[test]
    fn test_game_result_saved() {
        let (mut m, link, t) = logged_in(ana_store());
        let t = play_discover(&mut m, t);
        assert_eq!(m.phase().name(), "resultado");
        assert!(link.is_listening());
        let stats = m.current_user().and_then(|u| u.stats("entrenamiento", "descubre").copied());
        assert_eq!(stats.map(|s| (s.play_count, s.last)), Some((1, 100.0)));

        m.handle_utterance("otra vez", t);
        assert_eq!(m.phase().name(), "jugando");
        m.handle_utterance("salir", t);
        assert_eq!(m.phase().name(), "seleccion_juego");
    }

    #[test]
    fn test_failed_save_keeps_session() {
        let mut store = ana_store();
        store.fail_writes = true;
        let (mut m, _link, t) = logged_in(store);
        play_discover(&mut m, t);
        assert_eq!(m.phase().name(), "resultado");
        assert_eq!(m.error_message(), Some("No se pudo guardar tu progreso."));
    }

    #[test]
    fn test_account_settings_and_progress() {
        let (mut m, _link, t) = logged_in(ana_store());
        m.handle_utterance("configuración", t);
        assert_eq!(m.phase().name(), "configuracion_cuenta");
        m.handle_utterance("cambiar nombre", t);
        m.handle_utterance("Anita", t);
        assert_eq!(m.current_user().map(|u| u.name.as_str()), Some("Anita"));
        assert!(m.session().banner.is_some());
        m.handle_utterance("idioma", t);
        m.handle_utterance("inglés", t);
        assert_eq!(m.current_user().map(|u| u.language.as_str()), Some("en"));
        m.handle_utterance("volver", t);
        assert_eq!(m.phase().name(), "menu_principal");

        m.handle_utterance("progreso", t);
        assert_eq!(m.phase().name(), "ver_progreso");
        assert!(m.display_lines(t).iter().any(|l| l.contains("Aún no has jugado")));
        m.handle_utterance("volver", t);
        m.handle_utterance("cerrar sesión", t);
        assert_eq!(m.phase().name(), "esperando_comando");
        assert!(m.current_user().is_none());
        m.handle_utterance("salir", t);
        assert!(m.is_finished());
    }
}
