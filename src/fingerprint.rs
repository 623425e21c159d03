// Heuristic device identifier, never authentication. The rolling 32-bit
// h = (h << 5) - h + byte hash stays non-cryptographic on purpose so
// fingerprints match what the existing clients compute.

use serde::{Deserialize, Serialize};

// Every signal is optional: an unavailable one (no WebGL, no plugins API)
// contributes an empty value instead of failing the computation.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSignals {
    // data-URI snapshot of a fixed canvas rendering
    pub canvas: Option<String>,
    pub screen_width: Option<i32>,
    pub screen_height: Option<i32>,
    pub color_depth: Option<i32>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub platform: Option<String>,
    pub user_agent: Option<String>,
    pub plugins: Vec<String>,
    pub webgl_vendor: Option<String>,
    pub webgl_renderer: Option<String>,
}

pub fn generate(signals: &ClientSignals) -> String {
    let combined = serde_json::json!({
        "canvas": signals.canvas.as_deref().unwrap_or(""),
        "screen": format!(
            "{}x{}x{}",
            signals.screen_width.unwrap_or(0),
            signals.screen_height.unwrap_or(0),
            signals.color_depth.unwrap_or(0),
        ),
        "timezone": signals.timezone.as_deref().unwrap_or(""),
        "language": signals.language.as_deref().unwrap_or(""),
        "platform": signals.platform.as_deref().unwrap_or(""),
        "userAgent": signals.user_agent.as_deref().unwrap_or(""),
        "plugins": signals.plugins.join(","),
        "webgl": format!(
            "{}~{}",
            signals.webgl_vendor.as_deref().unwrap_or(""),
            signals.webgl_renderer.as_deref().unwrap_or(""),
        ),
    })
    .to_string();

    let mut hash: i32 = 0;
    for byte in combined.bytes() {
        hash = (hash << 5).wrapping_sub(hash).wrapping_add(byte as i32);
    }
    format!("{:x}", hash.unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn signals() -> ClientSignals {
        ClientSignals {
            canvas: Some("data:image/png;base64,AAAA".into()),
            screen_width: Some(1920),
            screen_height: Some(1080),
            color_depth: Some(24),
            timezone: Some("Europe/Moscow".into()),
            language: Some("ru-RU".into()),
            platform: Some("Win32".into()),
            user_agent: Some("Mozilla/5.0".into()),
            plugins: vec!["PDF Viewer".into(), "Chrome PDF Viewer".into()],
            webgl_vendor: Some("Google Inc.".into()),
            webgl_renderer: Some("ANGLE (NVIDIA)".into()),
        }
    }

    #[test]
    fn same_signals_same_fingerprint() {
        assert_eq!(generate(&signals()), generate(&signals()));
    }

    #[test]
    fn changed_signal_changes_fingerprint() {
        let mut other = signals();
        other.user_agent = Some("Mozilla/5.0 (X11; Linux x86_64)".into());
        assert_ne!(generate(&signals()), generate(&other));
    }

    #[test]
    fn missing_signals_degrade_to_empty_contribution() {
        let fp = generate(&ClientSignals::default());
        assert!(!fp.is_empty());
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn absent_webgl_differs_from_present() {
        let mut no_gl = signals();
        no_gl.webgl_vendor = None;
        no_gl.webgl_renderer = None;
        assert_ne!(generate(&signals()), generate(&no_gl));
    }
}
