//! API key field with a verified-key shadow.
//!
//! # States
//! ```text
//!  Empty              nothing typed
//!  Typing             edited since the last verification
//!  Verified { len }   the visible value is the shadow, a key the API accepted
//! ```
//!
//! The shadow remembers the last key verified for the current endpoint.
//! An edit whose length equals the shadow's length is taken to be the same
//! key pasted or retyped, and asks for an automatic load.  Only the length
//! is compared, never the value.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyState {
    #[default]
    Empty,
    Typing,
    Verified {
        len: usize,
    },
}

#[derive(Debug, Clone, Default)]
pub struct KeyField {
    value: String,
    shadow: Option<String>,
    state: KeyState,
}

/// Length in Unicode scalar values; equals the UTF-16 length for ASCII keys.
fn key_len(key: &str) -> usize {
    key.chars().count()
}

impl KeyField {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn shadow(&self) -> Option<&str> {
        self.shadow.as_deref()
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        matches!(self.state, KeyState::Verified { .. })
    }

    /// Apply one edit of the visible value.  Returns `true` when the edit
    /// should trigger an automatic load.
    pub fn edit(&mut self, text: &str) -> bool {
        if text == self.value {
            return false;
        }
        self.value = text.to_string();
        if self.value.is_empty() {
            self.state = KeyState::Empty;
            return false;
        }
        self.state = KeyState::Typing;

        match self.shadow.as_deref() {
            Some(shadow) if !shadow.is_empty() => key_len(shadow) == key_len(&self.value),
            _ => false,
        }
    }

    /// A key remembered for this endpoint was found: show it and treat it
    /// as verified.
    pub fn populate_verified(&mut self, key: &str) {
        self.value = key.to_string();
        self.shadow = Some(key.to_string());
        self.state = KeyState::Verified { len: key_len(key) };
    }

    /// The API accepted `key`.  The visible value only becomes verified if
    /// it was not edited away in the meantime.
    pub fn mark_verified(&mut self, key: &str) {
        self.shadow = Some(key.to_string());
        if self.value == key {
            self.state = KeyState::Verified { len: key_len(key) };
        }
    }

    /// Forget the visible value and the shadow.
    pub fn clear(&mut self) {
        self.value.clear();
        self.shadow = None;
        self.state = KeyState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `key` one keystroke at a time, returning how many edits asked
    /// for an automatic load.
    fn type_out(field: &mut KeyField, key: &str) -> usize {
        let mut typed = String::new();
        let mut fired = 0;
        for c in key.chars() {
            typed.push(c);
            if field.edit(&typed) {
                fired += 1;
            }
        }
        fired
    }

    #[test]
    fn without_a_shadow_nothing_fires() {
        let mut field = KeyField::new();
        assert_eq!(type_out(&mut field, "abcdef"), 0);
        assert_eq!(field.state(), KeyState::Typing);
    }

    #[test]
    fn retyping_a_key_of_the_verified_length_fires_once() {
        let mut field = KeyField::new();
        field.populate_verified("secret-key");
        assert_eq!(field.state(), KeyState::Verified { len: 10 });

        field.edit("");
        assert_eq!(field.state(), KeyState::Empty);
        // Different characters, same length: the heuristic only counts.
        assert_eq!(type_out(&mut field, "other-key!"), 1);
        assert_eq!(field.state(), KeyState::Typing);
    }

    #[test]
    fn pasting_the_whole_key_fires_once() {
        let mut field = KeyField::new();
        field.populate_verified("abc123");
        field.edit("");
        assert!(field.edit("abc123"));
        assert!(!field.edit("abc123"));
        assert!(!field.edit("abc1234"));
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let mut field = KeyField::new();
        field.populate_verified("ключ");
        field.edit("");
        assert!(field.edit("abcd"));
    }

    #[test]
    fn mark_verified_respects_later_edits() {
        let mut field = KeyField::new();
        field.edit("first");
        field.edit("second");
        field.mark_verified("first");
        assert_eq!(field.shadow(), Some("first"));
        assert_eq!(field.state(), KeyState::Typing);

        field.mark_verified("second");
        assert!(field.is_verified());
    }

    #[test]
    fn clear_forgets_the_shadow() {
        let mut field = KeyField::new();
        field.populate_verified("abc");
        field.clear();
        assert_eq!(field.value(), "");
        assert_eq!(field.shadow(), None);
        assert!(!field.edit("xyz"));
    }
}
