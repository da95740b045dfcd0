//! One module per package manager (§4.6–§4.12).
//!
//! Every resolver exposes a single `resolve(&ResolveContext, &PackageInput)
//! -> Result<ResolverResult, Cachi2Error>` entry point. [`dispatch`] routes
//! an already-validated [`PackageInput`] to the matching module; the
//! Dispatcher in `crate::dispatcher` is what calls `dispatch` for every
//! package, concurrently, and merges the results.

pub mod bundler;
pub mod cargo;
pub mod generic;
pub mod gomod;
pub mod npm;
pub mod pip;
pub mod yarn_berry;
pub mod yarn_classic;

use cachi2_types::{PackageManager, PackageInput, Request, ResolverResult};
use chrono::Utc;

use crate::diagnostics::EventLog;
use crate::error::Cachi2Error;

/// Shared, read-only context every resolver needs. Built once per
/// [`Request`] and handed to every concurrent resolver invocation.
pub struct ResolveContext<'a> {
    pub request: &'a Request,
    pub events: &'a EventLog,
}

impl<'a> ResolveContext<'a> {
    pub fn new(request: &'a Request, events: &'a EventLog) -> Self {
        Self { request, events }
    }
}

/// Routes `input` to its resolver, bracketing the call with
/// `PackageStarted`/`PackageCompleted` diagnostic events.
pub fn dispatch(ctx: &ResolveContext, input: &PackageInput) -> Result<ResolverResult, Cachi2Error> {
    let pm = input.manager();
    let path = input.path().as_path();
    ctx.events.package_started(pm, path, Utc::now());

    let result = match input {
        PackageInput::Gomod { .. } => gomod::resolve(ctx, input),
        PackageInput::Pip { .. } => pip::resolve(ctx, input),
        PackageInput::Npm { .. } => npm::resolve(ctx, input),
        PackageInput::YarnClassic { .. } => yarn_classic::resolve(ctx, input),
        PackageInput::YarnBerry { .. } => yarn_berry::resolve(ctx, input),
        PackageInput::Cargo { .. } => cargo::resolve(ctx, input),
        PackageInput::Bundler { .. } => bundler::resolve(ctx, input),
        PackageInput::Generic { .. } => generic::resolve(ctx, input),
    };

    if let Ok(ref resolved) = result {
        ctx.events.package_completed(pm, path, resolved.components.len(), Utc::now());
    }
    result
}

/// A couple of the non-goal dev-only managers (none currently defined
/// beyond the eight in `PackageManager`) are gated by
/// `flags.dev_package_managers`; this helper is the single place that gate
/// is checked, so a future dev-only manager only needs to list itself here.
pub fn is_dev_only(_pm: PackageManager) -> bool {
    false
}
