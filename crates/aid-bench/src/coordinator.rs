//! Policy rules tying the key field, the store and the option caches
//! together.
//!
//! The coordinator is pure state: every input returns the [`SyncEffect`]s
//! the caller must carry out, and the results of those effects come back in
//! through the `*_finished` / `*_loaded` methods.  Results for an endpoint or
//! key that is no longer current are ignored.

use thiserror::Error;
use tracing::debug;

use crate::key_field::KeyField;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    /// Look up the key remembered for `endpoint`.
    LookupKey { endpoint: String },
    /// Fetch the style options; this is the load that verifies a key.
    FetchStyles { endpoint: String, api_key: String },
    /// Remember a verified key for its endpoint.
    PersistKey { endpoint: String, api_key: String },
    /// Make sure the shared room options are loaded for this key.
    EnsureRoomOptions { endpoint: String, api_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("please enter an API key")]
    MissingKey,
    #[error("no endpoint selected")]
    NoEndpoint,
}

#[derive(Debug, Default)]
pub struct SyncCoordinator {
    endpoint: Option<String>,
    key: KeyField,
    /// Key whose style load is running, if any.
    loading: Option<String>,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn key(&self) -> &KeyField {
        &self.key
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn select_endpoint(&mut self, endpoint: &str) -> Vec<SyncEffect> {
        if self.endpoint.as_deref() == Some(endpoint) {
            return Vec::new();
        }
        debug!("coordinator: endpoint -> {}", endpoint);
        self.endpoint = Some(endpoint.to_string());
        self.loading = None;
        vec![SyncEffect::LookupKey {
            endpoint: endpoint.to_string(),
        }]
    }

    /// A remembered key was found (or not) for `endpoint`.
    pub fn key_lookup_finished(&mut self, endpoint: &str, key: Option<String>) -> Vec<SyncEffect> {
        if self.endpoint.as_deref() != Some(endpoint) {
            debug!("coordinator: ignoring stale key lookup for {}", endpoint);
            return Vec::new();
        }
        match key.filter(|k| !k.is_empty()) {
            Some(key) => {
                self.key.populate_verified(&key);
                self.begin_load(key)
            }
            None => {
                self.key.clear();
                Vec::new()
            }
        }
    }

    pub fn edit_key(&mut self, text: &str) -> Vec<SyncEffect> {
        if self.key.edit(text) {
            debug!("coordinator: key length matches verified key, reusing");
            self.begin_load(text.to_string())
        } else {
            Vec::new()
        }
    }

    /// The explicit "load" action.  A no-op while the same key is loading;
    /// a different key replaces the running load.
    pub fn request_load(&mut self) -> Result<Vec<SyncEffect>, SyncError> {
        if self.endpoint.is_none() {
            return Err(SyncError::NoEndpoint);
        }
        if self.key.value().is_empty() {
            return Err(SyncError::MissingKey);
        }
        Ok(self.begin_load(self.key.value().to_string()))
    }

    fn begin_load(&mut self, api_key: String) -> Vec<SyncEffect> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Vec::new();
        };
        match &self.loading {
            Some(running) if *running == api_key => {
                debug!("coordinator: load for this key already running, skipping");
                return Vec::new();
            }
            Some(_) => debug!("coordinator: newer key supersedes the running load"),
            None => {}
        }
        self.loading = Some(api_key.clone());
        vec![SyncEffect::FetchStyles { endpoint, api_key }]
    }

    fn is_current_load(&self, endpoint: &str, api_key: &str) -> bool {
        self.endpoint.as_deref() == Some(endpoint) && self.loading.as_deref() == Some(api_key)
    }

    /// The style fetch for `(endpoint, api_key)` succeeded.  Returns an empty
    /// list when that load has been superseded.
    pub fn styles_loaded(&mut self, endpoint: &str, api_key: &str) -> Vec<SyncEffect> {
        if !self.is_current_load(endpoint, api_key) {
            debug!("coordinator: ignoring stale style load for {}", endpoint);
            return Vec::new();
        }
        self.loading = None;
        self.key.mark_verified(api_key);
        vec![
            SyncEffect::PersistKey {
                endpoint: endpoint.to_string(),
                api_key: api_key.to_string(),
            },
            SyncEffect::EnsureRoomOptions {
                endpoint: endpoint.to_string(),
                api_key: api_key.to_string(),
            },
        ]
    }

    /// The style fetch failed.  Returns `false` when that load was already
    /// superseded and the failure should not be reported.
    pub fn styles_failed(&mut self, endpoint: &str, api_key: &str) -> bool {
        if !self.is_current_load(endpoint, api_key) {
            return false;
        }
        self.loading = None;
        true
    }

    /// Endpoint and verified key the room selectors should load with.
    pub fn room_options_target(&self) -> Option<(String, String)> {
        let endpoint = self.endpoint.clone()?;
        let key = self.key.shadow().filter(|k| !k.is_empty())?;
        Some((endpoint, key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_field::KeyState;

    const STG: &str = "https://stg.test/api/open/v1";
    const PROD: &str = "https://prod.test/api/open/v1";

    fn fetches(effects: &[SyncEffect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, SyncEffect::FetchStyles { .. }))
            .count()
    }

    #[test]
    fn switching_to_endpoint_without_key_clears_field() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        sync.key_lookup_finished(STG, Some("stg-key".into()));
        assert_eq!(sync.key().value(), "stg-key");

        let effects = sync.select_endpoint(PROD);
        assert_eq!(
            effects,
            vec![SyncEffect::LookupKey {
                endpoint: PROD.into()
            }]
        );
        assert!(sync.key_lookup_finished(PROD, None).is_empty());
        assert_eq!(sync.key().value(), "");
        assert_eq!(sync.key().shadow(), None);
        assert_eq!(sync.key().state(), KeyState::Empty);
    }

    #[test]
    fn switching_to_endpoint_with_key_populates_and_verifies() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(PROD);
        let effects = sync.key_lookup_finished(PROD, Some("prod-key".into()));

        assert_eq!(sync.key().value(), "prod-key");
        assert_eq!(sync.key().state(), KeyState::Verified { len: 8 });
        assert_eq!(
            effects,
            vec![SyncEffect::FetchStyles {
                endpoint: PROD.into(),
                api_key: "prod-key".into()
            }]
        );
    }

    #[test]
    fn stale_lookup_is_ignored() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        sync.select_endpoint(PROD);
        assert!(sync.key_lookup_finished(STG, Some("stg-key".into())).is_empty());
        assert_eq!(sync.key().value(), "");
    }

    #[test]
    fn typing_a_same_length_key_triggers_one_fetch() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        sync.key_lookup_finished(STG, Some("0123456789".into()));
        let effects = sync.styles_loaded(STG, "0123456789");
        assert_eq!(effects.len(), 2);

        sync.edit_key("");
        let mut total = 0;
        let mut typed = String::new();
        for c in "9876543210".chars() {
            typed.push(c);
            total += fetches(&sync.edit_key(&typed));
        }
        assert_eq!(total, 1);
        assert!(sync.is_loading());
    }

    #[test]
    fn load_is_a_noop_while_running_and_validates_input() {
        let mut sync = SyncCoordinator::new();
        assert_eq!(sync.request_load(), Err(SyncError::NoEndpoint));

        sync.select_endpoint(STG);
        assert_eq!(sync.request_load(), Err(SyncError::MissingKey));

        sync.edit_key("abc");
        assert_eq!(fetches(&sync.request_load().unwrap()), 1);
        assert_eq!(fetches(&sync.request_load().unwrap()), 0);

        assert!(sync.styles_failed(STG, "abc"));
        assert_eq!(fetches(&sync.request_load().unwrap()), 1);
    }

    #[test]
    fn newer_key_supersedes_running_load() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        let startup = sync.key_lookup_finished(STG, Some("abcdefgh".into()));
        assert_eq!(fetches(&startup), 1);

        let effects = sync.edit_key("hgfedcba");
        assert_eq!(
            effects,
            vec![SyncEffect::FetchStyles {
                endpoint: STG.into(),
                api_key: "hgfedcba".into()
            }]
        );

        assert!(sync.styles_loaded(STG, "abcdefgh").is_empty());
        assert!(!sync.key().is_verified());
        assert_eq!(sync.styles_loaded(STG, "hgfedcba").len(), 2);
        assert!(sync.key().is_verified());
        assert_eq!(sync.key().shadow(), Some("hgfedcba"));
    }

    #[test]
    fn successful_load_persists_and_fetches_rooms_with_verified_key() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        sync.edit_key("fresh");
        sync.request_load().unwrap();
        assert_eq!(sync.room_options_target(), None);

        let effects = sync.styles_loaded(STG, "fresh");
        assert_eq!(
            effects,
            vec![
                SyncEffect::PersistKey {
                    endpoint: STG.into(),
                    api_key: "fresh".into()
                },
                SyncEffect::EnsureRoomOptions {
                    endpoint: STG.into(),
                    api_key: "fresh".into()
                },
            ]
        );
        assert!(sync.key().is_verified());
        assert_eq!(
            sync.room_options_target(),
            Some((STG.to_string(), "fresh".to_string()))
        );
    }

    #[test]
    fn results_for_a_previous_endpoint_are_dropped() {
        let mut sync = SyncCoordinator::new();
        sync.select_endpoint(STG);
        sync.edit_key("k");
        sync.request_load().unwrap();
        sync.select_endpoint(PROD);

        assert!(sync.styles_loaded(STG, "k").is_empty());
        assert!(!sync.styles_failed(STG, "k"));
        assert!(!sync.key().is_verified());
    }
}
