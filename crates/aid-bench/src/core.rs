//! BenchCore: single-owner event loop for the test-bench form.
//!
//! All tasks that produce results for the form (key lookups, option fetches,
//! pipeline outputs) send `CoreEvent` messages to this loop.  BenchCore owns
//! the form state and the `SyncCoordinator` exclusively; no other task
//! touches them.
//!
//! Anything a front end should show is broadcast as a `Notice` on a
//! `tokio::sync::broadcast` channel.
//!
//! Coordinator effects that go to the network or read a key run as spawned
//! tasks and report back through the event channel.  When the loop stops,
//! the receiver is dropped and late results are discarded with it.

use std::sync::Arc;

use aid_proto::config::Config;
use aid_proto::protocol::{OptionItem, OptionKind};
use aid_proto::store::{ImageId, Store, StoreError};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::Action;
use crate::api::{ApiError, OptionsClient};
use crate::coordinator::{SyncCoordinator, SyncEffect, SyncError};
use crate::key_field::KeyState;
use crate::options::{OptionList, OptionsCache};
use crate::preview::{PreviewItem, PreviewOutcome, PreviewPipeline};
use crate::upload::{UploadFile, UploadOutcome, UploadPipeline, UploadPolicy};

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the BenchCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A user action from the front end.
    Action(Action),
    KeyLookup {
        endpoint: String,
        result: Result<Option<String>, StoreError>,
    },
    StylesFetched {
        endpoint: String,
        api_key: String,
        result: Result<Vec<OptionItem>, ApiError>,
    },
    /// The shared room option list was replaced.
    RoomOptionsChanged(OptionList),
    RoomOptionsFailed(ApiError),
    /// Startup enumeration of the stored images.
    ImagesInitialized(Result<Vec<ImageId>, StoreError>),
    UploadFinished(UploadOutcome),
    PreviewLoaded(PreviewOutcome),
}

// ── Notice ────────────────────────────────────────────────────────────────────

/// What gets sent on submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormValues {
    pub api_url: String,
    pub api_key: String,
    pub style: Vec<String>,
    pub image_id_list: Vec<ImageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSnapshot {
    pub endpoint: Option<String>,
    pub api_key: String,
    pub key_state: KeyState,
    pub loading: bool,
    pub style_options: Vec<OptionItem>,
    pub style: Vec<String>,
    pub room_options: Vec<OptionItem>,
    pub image_ids: Vec<ImageId>,
    pub previews: Vec<PreviewItem>,
}

/// Broadcast to every front end.
#[derive(Debug, Clone)]
pub enum Notice {
    Info(String),
    Error(String),
    /// A picked file failed the upload policy.
    Rejected(String),
    KeyChanged { value: String, state: KeyState },
    StyleOptions(Vec<OptionItem>),
    RoomOptions(OptionList),
    ImagesChanged(Vec<ImageId>),
    Previews(Vec<PreviewItem>),
    Submitted(FormValues),
    Snapshot(FormSnapshot),
}

// ── CoreHandle ────────────────────────────────────────────────────────────────

/// Sending side of the core loop, for front ends.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl CoreHandle {
    /// Returns `false` once the core has stopped.
    pub fn send(&self, action: Action) -> bool {
        self.tx.send(CoreEvent::Action(action)).is_ok()
    }
}

// ── BenchCore ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FormState {
    style_options: Vec<OptionItem>,
    style: Vec<String>,
    room_options: OptionList,
    image_ids: Vec<ImageId>,
    previews: Vec<PreviewItem>,
}

pub struct BenchCore {
    config: Config,
    store: Arc<Store>,
    client: OptionsClient,
    room_options: Arc<OptionsCache>,
    policy: UploadPolicy,
    sync: SyncCoordinator,
    form: FormState,
    upload: Option<UploadPipeline>,
    preview: Option<PreviewPipeline>,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<CoreEvent>>,
    notices: broadcast::Sender<Notice>,
    /// Cancelled on teardown; stops the room option observer.
    cancel: CancellationToken,
}

impl BenchCore {
    /// Must be called from inside a tokio runtime: the upload and preview
    /// pipelines start immediately.
    pub fn new(
        config: Config,
        store: Arc<Store>,
        client: OptionsClient,
        room_options: Arc<OptionsCache>,
        notices: broadcast::Sender<Notice>,
    ) -> (Self, CoreHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        let upload = UploadPipeline::spawn(Arc::clone(&store), &config.pipeline, move |outcome| {
            let _ = tx.send(CoreEvent::UploadFinished(outcome));
        });

        let tx = events_tx.clone();
        let preview = PreviewPipeline::spawn(
            Arc::clone(&store),
            config.store.preview_dir.clone(),
            &config.pipeline,
            move |outcome| {
                let _ = tx.send(CoreEvent::PreviewLoaded(outcome));
            },
        );

        let handle = CoreHandle {
            tx: events_tx.clone(),
        };
        let core = Self {
            policy: UploadPolicy::new(&config.upload),
            config,
            store,
            client,
            room_options,
            sync: SyncCoordinator::new(),
            form: FormState::default(),
            upload: Some(upload),
            preview: Some(preview),
            events_tx,
            events_rx: Some(events_rx),
            notices,
            cancel: CancellationToken::new(),
        };
        (core, handle)
    }

    /// Run the core event loop until a `Quit` action arrives.
    pub async fn run(mut self) {
        let Some(mut events_rx) = self.events_rx.take() else {
            error!("BenchCore: run called twice");
            return;
        };
        info!("BenchCore: starting event loop");

        self.spawn_room_observer();
        self.spawn_image_init();
        let default_endpoint = self.config.api.default_endpoint.clone();
        self.handle_action(Action::SelectEndpoint(default_endpoint))
            .await;

        while let Some(event) = events_rx.recv().await {
            match event {
                CoreEvent::Action(Action::Quit) => {
                    info!("BenchCore: quit requested");
                    break;
                }
                CoreEvent::Action(action) => {
                    debug!("BenchCore: action {:?}", action);
                    self.handle_action(action).await;
                }
                CoreEvent::KeyLookup { endpoint, result } => {
                    self.on_key_lookup(endpoint, result).await;
                }
                CoreEvent::StylesFetched {
                    endpoint,
                    api_key,
                    result,
                } => {
                    self.on_styles_fetched(endpoint, api_key, result).await;
                }
                CoreEvent::RoomOptionsChanged(list) => {
                    debug!("BenchCore: {} room option(s)", list.len());
                    self.form.room_options = Arc::clone(&list);
                    self.notify(Notice::RoomOptions(list));
                }
                CoreEvent::RoomOptionsFailed(e) => {
                    self.report_error(format!("failed to fetch room options: {}", e));
                }
                CoreEvent::ImagesInitialized(result) => self.on_images_initialized(result),
                CoreEvent::UploadFinished(outcome) => self.on_upload_finished(outcome),
                CoreEvent::PreviewLoaded(outcome) => self.on_preview_loaded(outcome),
            }
        }

        self.teardown();
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(upload) = self.upload.take() {
            upload.shutdown();
        }
        if let Some(preview) = self.preview.take() {
            preview.teardown();
        }
        info!("BenchCore: stopped");
    }

    // ── Actions ───────────────────────────────────────────────────────────────

    async fn handle_action(&mut self, action: Action) {
        match action {
            Action::SelectEndpoint(selector) => match self.config.api.resolve_endpoint(&selector) {
                Some(endpoint) => {
                    if self.sync.endpoint() != Some(endpoint.as_str()) {
                        self.form.style_options.clear();
                        self.form.style.clear();
                        self.notify(Notice::StyleOptions(Vec::new()));
                        self.notify(Notice::Info(format!("endpoint: {}", endpoint)));
                    }
                    let effects = self.sync.select_endpoint(&endpoint);
                    self.apply(effects).await;
                }
                None => self.report_error(format!("unknown endpoint: {}", selector)),
            },

            Action::EditKey(text) => {
                let effects = self.sync.edit_key(&text);
                self.notify_key();
                self.apply(effects).await;
            }

            Action::LoadKey => match self.sync.request_load() {
                Ok(effects) if effects.is_empty() => {
                    self.notify(Notice::Info("a load is already running".to_string()));
                }
                Ok(effects) => self.apply(effects).await,
                Err(e) => self.report_error(e.to_string()),
            },

            Action::SelectFiles(selection) => self.select_files(selection),

            Action::SetRoomType { id, room_type } => self.set_room_type(id, room_type).await,

            Action::DeleteImage(id) => match self.store.delete_by_id(id.as_str()).await {
                Ok(()) => {
                    if let Some(preview) = &self.preview {
                        preview.release(&id);
                    }
                    self.form.image_ids.retain(|i| *i != id);
                    self.form.previews.retain(|p| p.id != id);
                    self.notify(Notice::Info(format!("deleted {}", id)));
                    self.images_changed();
                }
                Err(e) => self.report_error(format!("failed to delete {}: {}", id, e)),
            },

            Action::DeleteAllImages => match self.store.delete_all_images().await {
                Ok(count) => {
                    self.forget_images();
                    self.notify(Notice::Info(format!("deleted {} image(s)", count)));
                }
                Err(e) => self.report_error(format!("failed to delete images: {}", e)),
            },

            Action::ResetStore => match self.store.delete_database().await {
                Ok(()) => {
                    self.forget_images();
                    self.notify(Notice::Info("database reset".to_string()));
                }
                Err(e) => self.report_error(format!("failed to reset database: {}", e)),
            },

            Action::ToggleStyle(style) => self.toggle_style(&style),

            Action::Submit => self.submit(),

            Action::Show => {
                let snapshot = self.snapshot();
                self.notify(Notice::Snapshot(snapshot));
            }

            Action::Quit => {}
        }
    }

    fn select_files(&mut self, selection: Option<Vec<UploadFile>>) {
        let selection = selection.map(|files| {
            let (accepted, rejected) = self.policy.partition(files);
            for rejection in rejected {
                self.notify(Notice::Rejected(rejection.to_string()));
            }
            accepted
        });
        if let Some(upload) = &self.upload {
            if let Err(e) = upload.select(selection) {
                warn!("BenchCore: {}", e);
            }
        }
    }

    async fn set_room_type(&mut self, id: ImageId, room_type: String) {
        let value = if self.form.room_options.is_empty() {
            room_type
        } else {
            match find_option(&self.form.room_options, &room_type) {
                Some(item) => item.value.clone(),
                None => {
                    self.report_error(format!("unknown room type: {}", room_type));
                    return;
                }
            }
        };

        match self.store.update_image_type(&id, &value).await {
            Ok(true) => {
                for preview in self.form.previews.iter_mut().filter(|p| p.id == id) {
                    preview.room_type = value.clone();
                }
                self.notify(Notice::Info(format!("{} room type: {}", id, value)));
            }
            Ok(false) => {
                debug!("BenchCore: room type for missing image {}", id);
                self.notify(Notice::Info(format!("{} no longer exists", id)));
            }
            Err(e) => self.report_error(format!("failed to update {}: {}", id, e)),
        }
    }

    fn toggle_style(&mut self, style: &str) {
        if self.form.style_options.is_empty() {
            self.report_error("no style options loaded; load an API key first".to_string());
            return;
        }
        let Some(value) = find_option(&self.form.style_options, style).map(|o| o.value.clone())
        else {
            self.report_error(format!("unknown style: {}", style));
            return;
        };
        if let Some(pos) = self.form.style.iter().position(|s| *s == value) {
            self.form.style.remove(pos);
        } else {
            self.form.style.push(value);
        }
        self.notify(Notice::Info(format!("style: [{}]", self.form.style.join(", "))));
    }

    fn submit(&mut self) {
        let api_key = self.sync.key().value().to_string();
        if api_key.is_empty() {
            self.report_error(SyncError::MissingKey.to_string());
            return;
        }
        let Some(endpoint) = self.sync.endpoint().map(str::to_string) else {
            self.report_error(SyncError::NoEndpoint.to_string());
            return;
        };
        if !self.form.style_options.is_empty() && self.form.style.is_empty() {
            self.report_error("please select at least one style".to_string());
            return;
        }

        let values = FormValues {
            api_url: endpoint,
            api_key,
            style: self.form.style.clone(),
            image_id_list: self.form.image_ids.clone(),
        };
        match serde_json::to_string(&values) {
            Ok(json) => info!("submit: {}", json),
            Err(e) => warn!("submit: failed to serialize form: {}", e),
        }
        self.notify(Notice::Submitted(values));
    }

    fn snapshot(&self) -> FormSnapshot {
        FormSnapshot {
            endpoint: self.sync.endpoint().map(str::to_string),
            api_key: self.sync.key().value().to_string(),
            key_state: self.sync.key().state(),
            loading: self.sync.is_loading(),
            style_options: self.form.style_options.clone(),
            style: self.form.style.clone(),
            room_options: self.form.room_options.as_ref().clone(),
            image_ids: self.form.image_ids.clone(),
            previews: self.form.previews.clone(),
        }
    }

    // ── Effects ───────────────────────────────────────────────────────────────

    async fn apply(&mut self, effects: Vec<SyncEffect>) {
        for effect in effects {
            match effect {
                SyncEffect::LookupKey { endpoint } => {
                    let store = Arc::clone(&self.store);
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let result = store.get_key_by_endpoint(&endpoint).await;
                        let _ = tx.send(CoreEvent::KeyLookup { endpoint, result });
                    });
                }
                SyncEffect::FetchStyles { endpoint, api_key } => {
                    self.notify(Notice::Info(format!("loading options from {}", endpoint)));
                    let client = self.client.clone();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let result = client
                            .fetch_options(OptionKind::Style, &endpoint, &api_key)
                            .await;
                        let _ = tx.send(CoreEvent::StylesFetched {
                            endpoint,
                            api_key,
                            result,
                        });
                    });
                }
                SyncEffect::PersistKey { endpoint, api_key } => {
                    if let Err(e) = self.store.set_key_by_endpoint(&endpoint, &api_key).await {
                        self.report_error(format!("failed to remember key: {}", e));
                    }
                }
                SyncEffect::EnsureRoomOptions { endpoint, api_key } => {
                    self.ensure_room_options(endpoint, api_key);
                }
            }
        }
    }

    fn ensure_room_options(&self, endpoint: String, api_key: String) {
        let cache = Arc::clone(&self.room_options);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.ensure_loaded(&endpoint, &api_key).await {
                let _ = tx.send(CoreEvent::RoomOptionsFailed(e));
            }
        });
    }

    fn spawn_room_observer(&self) {
        let mut subscription = self.room_options.subscribe();
        let tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = subscription.next() => next,
                };
                let Some(list) = next else { break };
                if tx.send(CoreEvent::RoomOptionsChanged(list)).is_err() {
                    break;
                }
            }
            debug!("BenchCore: room option observer stopped");
        });
    }

    fn spawn_image_init(&self) {
        let store = Arc::clone(&self.store);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = store.get_all_image_ids().await;
            let _ = tx.send(CoreEvent::ImagesInitialized(result));
        });
    }

    // ── Results ───────────────────────────────────────────────────────────────

    async fn on_key_lookup(&mut self, endpoint: String, result: Result<Option<String>, StoreError>) {
        match result {
            Ok(key) => {
                let found = key.is_some();
                let effects = self.sync.key_lookup_finished(&endpoint, key);
                if self.sync.endpoint() == Some(endpoint.as_str()) {
                    debug!("BenchCore: key lookup for {} found={}", endpoint, found);
                    self.notify_key();
                }
                self.apply(effects).await;
            }
            Err(e) => self.report_error(format!("failed to read key for {}: {}", endpoint, e)),
        }
    }

    async fn on_styles_fetched(
        &mut self,
        endpoint: String,
        api_key: String,
        result: Result<Vec<OptionItem>, ApiError>,
    ) {
        match result {
            Ok(items) => {
                let effects = self.sync.styles_loaded(&endpoint, &api_key);
                if effects.is_empty() {
                    debug!("BenchCore: dropping superseded style options");
                    return;
                }
                self.form
                    .style
                    .retain(|s| items.iter().any(|item| item.value == *s));
                self.form.style_options = items.clone();
                self.apply(effects).await;
                self.notify(Notice::StyleOptions(items));
                self.notify_key();
            }
            Err(e) => {
                if self.sync.styles_failed(&endpoint, &api_key) {
                    self.report_error(format!("failed to fetch options: {}", e));
                }
            }
        }
    }

    fn on_images_initialized(&mut self, result: Result<Vec<ImageId>, StoreError>) {
        match result {
            Ok(mut ids) => {
                info!("BenchCore: {} stored image(s)", ids.len());
                for id in self.form.image_ids.drain(..) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                self.form.image_ids = ids;
                self.images_changed();
            }
            Err(e) => error!("BenchCore: failed to enumerate stored images: {}", e),
        }
    }

    fn on_upload_finished(&mut self, outcome: UploadOutcome) {
        match outcome {
            Ok(ids) => {
                self.notify(Notice::Info(format!("uploaded {} image(s)", ids.len())));
                self.form.image_ids.extend(ids);
                self.images_changed();
            }
            Err(e) => self.report_error(format!("failed to save images: {}", e)),
        }
    }

    fn on_preview_loaded(&mut self, outcome: PreviewOutcome) {
        match outcome {
            Ok(items) => {
                // Every preview carries its own room selector, and each one
                // asks the shared cache to load.
                if let Some((endpoint, api_key)) = self.sync.room_options_target() {
                    for _ in &items {
                        self.ensure_room_options(endpoint.clone(), api_key.clone());
                    }
                }
                self.form.previews = items.clone();
                self.notify(Notice::Previews(items));
            }
            Err(e) => self.report_error(format!("failed to load previews: {}", e)),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// The image id list changed: tell front ends and reload the previews.
    fn images_changed(&mut self) {
        self.notify(Notice::ImagesChanged(self.form.image_ids.clone()));
        if let Some(preview) = &self.preview {
            if let Err(e) = preview.show(self.form.image_ids.clone()) {
                warn!("BenchCore: {}", e);
            }
        }
    }

    fn forget_images(&mut self) {
        if let Some(preview) = &self.preview {
            for id in &self.form.image_ids {
                preview.release(id);
            }
        }
        self.form.image_ids.clear();
        self.form.previews.clear();
        self.images_changed();
    }

    fn notify_key(&self) {
        let key = self.sync.key();
        self.notify(Notice::KeyChanged {
            value: key.value().to_string(),
            state: key.state(),
        });
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine: nothing is listening yet.
        let _ = self.notices.send(notice);
    }

    fn report_error(&self, message: String) {
        warn!("BenchCore: {}", message);
        self.notify(Notice::Error(message));
    }
}

/// Match an option by value, then by label, ignoring case.
fn find_option<'a>(options: &'a [OptionItem], wanted: &str) -> Option<&'a OptionItem> {
    options
        .iter()
        .find(|o| o.value.eq_ignore_ascii_case(wanted))
        .or_else(|| options.iter().find(|o| o.label.eq_ignore_ascii_case(wanted)))
}
