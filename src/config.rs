use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::catalog::CatalogEntry;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default)]
    pub face: FaceConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub games: GamesConfig,
    /// マーカーID→コンテンツ表の上書き（空なら組み込み表）
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: i32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    /// キャリブレーションJSON（無ければ概算の内部パラメータ）
    #[serde(default = "default_calibration_path")]
    pub calibration_path: String,
    /// calibration.json 内のどのカメラを使うか
    #[serde(default)]
    pub calibration_camera: i32,
}

fn default_camera_width() -> u32 { 1280 }
fn default_camera_height() -> u32 { 720 }
fn default_calibration_path() -> String { "calibration.json".to_string() }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            calibration_path: default_calibration_path(),
            calibration_camera: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarkerConfig {
    /// ArUco辞書タイプ (e.g. "DICT_5X5_50")
    #[serde(default = "default_dictionary")]
    pub dictionary: String,
    /// マーカー辺長（メートル）
    #[serde(default = "default_marker_length")]
    pub marker_length: f64,
    /// 消去時にバウンディングボックスを広げるピクセル数
    #[serde(default = "default_erase_margin")]
    pub erase_margin: i32,
    #[serde(default = "default_true")]
    pub erase: bool,
    /// 常に描画するマスコットのマーカーID
    #[serde(default)]
    pub mascot_marker: i32,
}

fn default_dictionary() -> String { "DICT_5X5_50".to_string() }
fn default_marker_length() -> f64 { 0.19 }
fn default_erase_margin() -> i32 { 10 }
fn default_true() -> bool { true }

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            dictionary: default_dictionary(),
            marker_length: default_marker_length(),
            erase_margin: default_erase_margin(),
            erase: true,
            mascot_marker: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FaceConfig {
    #[serde(default = "default_cascade_path")]
    pub cascade_path: String,
    /// 顔埋め込みONNXモデル
    #[serde(default = "default_face_model")]
    pub model_path: String,
    #[serde(default = "default_face_input")]
    pub input_name: String,
    #[serde(default = "default_face_output")]
    pub output_name: String,
    /// 顔が連続で見えたら安定とみなすフレーム数
    #[serde(default = "default_stable_frames")]
    pub stable_frames: u32,
}

fn default_cascade_path() -> String { "models/haarcascade_frontalface_default.xml".to_string() }
fn default_face_model() -> String { "models/face_embedding.onnx".to_string() }
fn default_face_input() -> String { "input".to_string() }
fn default_face_output() -> String { "embedding".to_string() }
fn default_stable_frames() -> u32 { 5 }

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            cascade_path: default_cascade_path(),
            model_path: default_face_model(),
            input_name: default_face_input(),
            output_name: default_face_output(),
            stable_frames: default_stable_frames(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoginConfig {
    /// コサイン類似度の閾値
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// ログイン失敗表示からコマンド待ちに戻るまで（秒）
    #[serde(default = "default_failed_cooldown")]
    pub failed_cooldown_secs: f32,
}

fn default_threshold() -> f32 { 0.92 }
fn default_failed_cooldown() -> f32 { 3.0 }

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            failed_cooldown_secs: default_failed_cooldown(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_listen_timeout")]
    pub listen_timeout_secs: f32,
    #[serde(default = "default_phrase_limit")]
    pub phrase_limit_secs: f32,
    /// 名前入力フェーズは長めに待つ
    #[serde(default = "default_name_listen_timeout")]
    pub name_listen_timeout_secs: f32,
    #[serde(default = "default_name_phrase_limit")]
    pub name_phrase_limit_secs: f32,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: f32,
    /// listening=false の間のポーリング間隔
    #[serde(default = "default_idle_poll")]
    pub idle_poll_ms: u64,
}

fn default_listen_timeout() -> f32 { 4.0 }
fn default_phrase_limit() -> f32 { 5.0 }
fn default_name_listen_timeout() -> f32 { 6.0 }
fn default_name_phrase_limit() -> f32 { 7.0 }
fn default_error_backoff() -> f32 { 1.0 }
fn default_idle_poll() -> u64 { 120 }

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            listen_timeout_secs: default_listen_timeout(),
            phrase_limit_secs: default_phrase_limit(),
            name_listen_timeout_secs: default_name_listen_timeout(),
            name_phrase_limit_secs: default_name_phrase_limit(),
            error_backoff_secs: default_error_backoff(),
            idle_poll_ms: default_idle_poll(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "data/usuarios.json".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    /// モデルの一様スケール
    #[serde(default = "default_model_scale")]
    pub model_scale: f64,
    #[serde(default = "default_ambient")]
    pub ambient: f32,
    #[serde(default = "default_window_title")]
    pub window_title: String,
}

fn default_model_scale() -> f64 { 0.15 }
fn default_ambient() -> f32 { 0.4 }
fn default_window_title() -> String { "Mundo de Luminia".to_string() }

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            model_scale: default_model_scale(),
            ambient: default_ambient(),
            window_title: default_window_title(),
        }
    }
}

/// スキャン窓のパラメータ（必要数、窓の長さ、猶予）
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    pub required: usize,
    pub window_secs: f32,
    pub grace_secs: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GamesConfig {
    #[serde(default = "default_discover_scan")]
    pub discover_scan: ScanConfig,
    #[serde(default = "default_discover_timeout")]
    pub discover_item_timeout_secs: f32,
    #[serde(default = "default_fruits_scan")]
    pub fruits_scan: ScanConfig,
    #[serde(default = "default_fruits_targets")]
    pub fruits_targets: usize,
    #[serde(default = "default_answer_timeout")]
    pub fruits_answer_timeout_secs: f32,
    #[serde(default = "default_categorize_scan")]
    pub categorize_scan: ScanConfig,
    /// 各カテゴリの最大数（果物・野菜それぞれ）
    #[serde(default = "default_categorize_per_kind")]
    pub categorize_per_kind: usize,
    #[serde(default = "default_answer_timeout")]
    pub categorize_answer_timeout_secs: f32,
    #[serde(default = "default_memory_scan")]
    pub memory_scan: ScanConfig,
    #[serde(default = "default_memory_length")]
    pub memory_length: usize,
    #[serde(default = "default_memory_item")]
    pub memory_item_secs: f32,
    #[serde(default = "default_answer_timeout")]
    pub memory_answer_timeout_secs: f32,
    /// 結果判定の成功ライン
    #[serde(default = "default_success_ratio")]
    pub success_ratio: f32,
}

fn default_discover_scan() -> ScanConfig {
    ScanConfig { required: 1, window_secs: 10.0, grace_secs: 5.0 }
}
fn default_discover_timeout() -> f32 { 15.0 }
fn default_fruits_scan() -> ScanConfig {
    ScanConfig { required: 3, window_secs: 10.0, grace_secs: 5.0 }
}
fn default_fruits_targets() -> usize { 3 }
fn default_answer_timeout() -> f32 { 30.0 }
fn default_categorize_scan() -> ScanConfig {
    ScanConfig { required: 6, window_secs: 12.0, grace_secs: 5.0 }
}
fn default_categorize_per_kind() -> usize { 3 }
fn default_memory_scan() -> ScanConfig {
    ScanConfig { required: 3, window_secs: 10.0, grace_secs: 5.0 }
}
fn default_memory_length() -> usize { 3 }
fn default_memory_item() -> f32 { 3.0 }
fn default_success_ratio() -> f32 { 0.8 }

impl Default for GamesConfig {
    fn default() -> Self {
        Self {
            discover_scan: default_discover_scan(),
            discover_item_timeout_secs: default_discover_timeout(),
            fruits_scan: default_fruits_scan(),
            fruits_targets: default_fruits_targets(),
            fruits_answer_timeout_secs: default_answer_timeout(),
            categorize_scan: default_categorize_scan(),
            categorize_per_kind: default_categorize_per_kind(),
            categorize_answer_timeout_secs: default_answer_timeout(),
            memory_scan: default_memory_scan(),
            memory_length: default_memory_length(),
            memory_item_secs: default_memory_item(),
            memory_answer_timeout_secs: default_answer_timeout(),
            success_ratio: default_success_ratio(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse config")?;
        Ok(config)
    }

    /// 読めなければデフォルト設定
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("using default config ({:#})", e);
                Self::default()
            }
        }
    }
}
