/*
 * Copyright 2024 Oxide Computer Company
 */

mod prelude {
    pub(crate) use crate::Central;
    pub use asyncbuild_types::*;
    pub use dropshot::{
        endpoint, ErrorStatusCode, HttpError, HttpResponseError,
        HttpResponseOk, Path as TypedPath, RequestContext, TypedBody,
    };
    pub use schemars::JsonSchema;
    pub use serde::{Deserialize, Serialize};
    pub use slog::{info, warn, Logger};
    pub use std::sync::Arc;

    pub type DSResult<T> = std::result::Result<T, HttpError>;
}

pub mod container;
