use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotkeyError {
    #[error("empty hotkey chord")]
    Empty,
    #[error("hotkey chord {chord:?} has no key")]
    MissingKey { chord: String },
    #[error("unknown modifier {modifier:?} in hotkey chord {chord:?}")]
    UnknownModifier { chord: String, modifier: String },
}

/// A key press as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub meta: bool,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }
}

/// A compiled `mod+shift+b` style chord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotkeyMatcher {
    key: String,
    ctrl: bool,
    alt: bool,
    shift: bool,
    meta: bool,
}

impl HotkeyMatcher {
    pub fn compile(chord: &str) -> Result<Self, HotkeyError> {
        let chord = chord.trim();
        if chord.is_empty() {
            return Err(HotkeyError::Empty);
        }

        let (modifiers, key) = match chord.strip_suffix("++") {
            Some(rest) => (rest, "+"),
            None => match chord.rsplit_once('+') {
                Some((modifiers, key)) => (modifiers, key),
                None => ("", chord),
            },
        };
        if key.is_empty() {
            return Err(HotkeyError::MissingKey {
                chord: chord.to_string(),
            });
        }

        let mut matcher = Self {
            key: canonical_key(key),
            ctrl: false,
            alt: false,
            shift: false,
            meta: false,
        };

        for modifier in modifiers.split('+').filter(|m| !m.is_empty()) {
            match modifier.to_ascii_lowercase().as_str() {
                "mod" => {
                    if cfg!(target_os = "macos") {
                        matcher.meta = true;
                    } else {
                        matcher.ctrl = true;
                    }
                }
                "ctrl" | "control" => matcher.ctrl = true,
                "alt" | "option" | "opt" => matcher.alt = true,
                "shift" => matcher.shift = true,
                "meta" | "cmd" | "command" | "super" | "win" => matcher.meta = true,
                _ => {
                    return Err(HotkeyError::UnknownModifier {
                        chord: chord.to_string(),
                        modifier: modifier.to_string(),
                    });
                }
            }
        }

        Ok(matcher)
    }

    pub fn matches(&self, event: &KeyEvent) -> bool {
        self.ctrl == event.ctrl
            && self.alt == event.alt
            && self.shift == event.shift
            && self.meta == event.meta
            && self.key == canonical_key(&event.key)
    }
}

fn canonical_key(key: &str) -> String {
    let lower = key.to_lowercase();
    match lower.as_str() {
        "return" => "enter".to_string(),
        "esc" => "escape".to_string(),
        "space" | "spacebar" => " ".to_string(),
        "plus" => "+".to_string(),
        "del" => "delete".to_string(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mod_event(key: &str) -> KeyEvent {
        if cfg!(target_os = "macos") {
            KeyEvent::new(key).meta()
        } else {
            KeyEvent::new(key).ctrl()
        }
    }

    #[test]
    fn mod_resolves_to_platform_modifier() {
        let m = HotkeyMatcher::compile("mod+b").unwrap();
        assert!(m.matches(&mod_event("b")));
        assert!(m.matches(&mod_event("B")));
        assert!(!m.matches(&KeyEvent::new("b")));
        assert!(!m.matches(&mod_event("b").shift()));
    }

    #[test]
    fn aliases_and_plus_key() {
        let m = HotkeyMatcher::compile("shift+Return").unwrap();
        assert!(m.matches(&KeyEvent::new("Enter").shift()));

        let plus = HotkeyMatcher::compile("ctrl++").unwrap();
        assert!(plus.matches(&KeyEvent::new("+").ctrl()));
    }

    #[test]
    fn malformed_chords_are_rejected() {
        assert_eq!(HotkeyMatcher::compile(" "), Err(HotkeyError::Empty));
        assert!(matches!(
            HotkeyMatcher::compile("hyper+k"),
            Err(HotkeyError::UnknownModifier { .. })
        ));
        assert!(matches!(
            HotkeyMatcher::compile("ctrl+"),
            Err(HotkeyError::MissingKey { .. })
        ));
    }
}
