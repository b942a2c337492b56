mod client;
mod multistatus;
mod watchdog;

pub use client::{
    ApiErrorClass, DEFAULT_INACTIVITY_TIMEOUT, DavClient, DavConfig, DavError, Resource,
    ResourceType, ServerType, UnknownServerType,
};
pub use multistatus::normalize_etag;
pub use reqwest::StatusCode;
