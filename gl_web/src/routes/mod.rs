//! ABOUTME: Route registration for the capture API

pub mod stream;
