/*
 * Copyright 2024 Oxide Computer Company
 */

/*!
 * Wire types shared between the build-task service and its clients.
 */

pub mod request;
pub mod status;

pub use request::*;
pub use status::*;
