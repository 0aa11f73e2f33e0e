mod http;
mod storage;
mod timer;

pub use self::http::{
    Http, HttpCapability, HttpError, HttpHeaders, HttpMethod, HttpOperation, HttpRequest,
    HttpResponse, HttpResult, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_REQUEST_BODY_SIZE,
    MAX_TIMEOUT_MS,
};
pub use self::storage::{
    KeyNamespace, Storage, StorageCapability, StorageEntry, StorageError, StorageKey,
    StorageOperation, StorageOutput, StorageResult, StorageTier, StorageValue, MAX_VALUE_SIZE,
};
pub use self::timer::{Timer, TimerCapability, TimerFired, TimerOperation};

pub use crux_core::render::Render;

use crate::Event;

pub type RenderCapability = Render<Event>;

#[derive(crux_core::macros::Effect)]
#[effect(app = "crate::app::App")]
pub struct Capabilities {
    pub render: RenderCapability,
    pub http: HttpCapability,
    pub storage: StorageCapability,
    pub timer: TimerCapability,
}
