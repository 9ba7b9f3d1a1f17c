//! Every user-initiated intent flowing into the core.

use aid_proto::store::ImageId;

use crate::upload::UploadFile;

#[derive(Debug, Clone)]
pub enum Action {
    // ── Key loader ───────────────────────────────────────────────────────────
    /// Endpoint by configured name or literal URL.
    SelectEndpoint(String),
    /// The key field's full new value (one call per keystroke).
    EditKey(String),
    LoadKey,

    // ── Images ───────────────────────────────────────────────────────────────
    /// A file-picker change event; `None` when it carried no file list.
    SelectFiles(Option<Vec<UploadFile>>),
    SetRoomType { id: ImageId, room_type: String },
    DeleteImage(ImageId),
    DeleteAllImages,
    ResetStore,

    // ── Form ─────────────────────────────────────────────────────────────────
    ToggleStyle(String),
    Submit,
    Show,
    Quit,
}
