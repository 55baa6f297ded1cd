// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (session auth, queue callback auth, security headers).

pub mod auth;
pub mod security;
pub mod tasks_auth;

pub use auth::{optional_auth, require_auth, AuthUser, MaybeAuthUser};
pub use tasks_auth::require_tasks_auth;
