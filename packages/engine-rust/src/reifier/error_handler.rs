//! Compiles [`ErrorHandlerDefinition`]s into [`RedeliveryErrorHandler`]s.

use std::sync::Arc;
use std::time::Duration;

use routeflow_core::SharedProcessor;

use super::builtins::send_to;
use super::CompileContext;
use crate::definition::{ErrorHandlerDefinition, ErrorHandlerKind, RedeliveryDefinition};
use crate::error::{CompileError, CompileResult};
use crate::errorhandler::{ExceptionPolicy, RedeliveryErrorHandler, RedeliveryPolicy};

/// Wraps `output` in the handler described by `definition`.
///
/// `label` names the wrapped node in logs and failure records. With
/// [`ErrorHandlerKind::NoErrorHandler`] `output` is returned unchanged.
///
/// # Errors
///
/// Fails if a redelivery setting does not resolve, the dead-letter URI
/// does not resolve, an on-exception handler fails to compile, or
/// asynchronous redelivery is requested without a worker pool.
pub fn wrap(
    definition: &ErrorHandlerDefinition,
    output: SharedProcessor,
    label: &str,
    ctx: &CompileContext<'_>,
) -> CompileResult<SharedProcessor> {
    let dead_letter = match &definition.kind {
        ErrorHandlerKind::NoErrorHandler => return Ok(output),
        ErrorHandlerKind::Default => None,
        ErrorHandlerKind::DeadLetter { uri } => {
            if uri.trim().is_empty() {
                return Err(CompileError::missing_field(label, "dead_letter_uri"));
            }
            Some(send_to(uri, ctx)?)
        }
    };

    let policy = redelivery_policy(&definition.redelivery, ctx.default_redelivery(), label, ctx)?;
    let mut any_async = policy.async_delayed_redelivery;
    let mut policies = Vec::with_capacity(definition.on_exceptions.len());
    for on_exception in &definition.on_exceptions {
        let redelivery = on_exception
            .redelivery
            .as_ref()
            .map(|overrides| redelivery_policy(overrides, &policy, label, ctx))
            .transpose()?;
        any_async |= redelivery.as_ref().is_some_and(|p| p.async_delayed_redelivery);
        let on_when = on_exception
            .on_when
            .as_ref()
            .map(|predicate| ctx.predicate(predicate))
            .transpose()?;
        let handler = if on_exception.outputs.is_empty() {
            None
        } else {
            Some(ctx.compile_pipeline(&on_exception.outputs)?)
        };
        policies.push(ExceptionPolicy {
            matchers: on_exception.exceptions.clone(),
            on_when,
            redelivery,
            handled: on_exception.handled,
            handler,
        });
    }

    let mut handler = RedeliveryErrorHandler::new(label, output, policy)
        .with_exception_policies(policies)
        .use_original_message(definition.use_original_message);
    if let Some(dead_letter) = dead_letter {
        handler = handler.with_dead_letter(dead_letter);
    }
    if any_async {
        handler = handler.with_pool(ctx.pool(definition.executor_ref.as_deref(), label)?);
    }
    Ok(Arc::new(handler))
}

/// Applies the set fields of `overrides` on top of `base`.
///
/// # Errors
///
/// Fails if a placeholder does not resolve or parse, or the backoff
/// settings are out of range.
pub fn redelivery_policy(
    overrides: &RedeliveryDefinition,
    base: &RedeliveryPolicy,
    node: &str,
    ctx: &CompileContext<'_>,
) -> CompileResult<RedeliveryPolicy> {
    let mut policy = base.clone();
    if let Some(max) = &overrides.maximum_redeliveries {
        let max = ctx.param(max, node, "maximum_redeliveries")?;
        policy.maximum_redeliveries = if max < 0 {
            None
        } else {
            Some(u32::try_from(max).unwrap_or(u32::MAX))
        };
    }
    if let Some(delay) = &overrides.redelivery_delay_ms {
        policy.redelivery_delay =
            Duration::from_millis(ctx.param(delay, node, "redelivery_delay_ms")?);
    }
    if let Some(delay) = &overrides.maximum_redelivery_delay_ms {
        policy.maximum_redelivery_delay =
            Duration::from_millis(ctx.param(delay, node, "maximum_redelivery_delay_ms")?);
    }
    if let Some(exponential) = overrides.use_exponential_backoff {
        policy.use_exponential_backoff = exponential;
    }
    if let Some(multiplier) = overrides.backoff_multiplier {
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(CompileError::invalid(
                node,
                format!("backoff_multiplier must be at least 1, got {multiplier}"),
            ));
        }
        policy.backoff_multiplier = multiplier;
    }
    if let Some(factor) = overrides.collision_avoidance_factor {
        if !(factor > 0.0 && factor < 1.0) {
            return Err(CompileError::invalid(
                node,
                format!("collision_avoidance_factor must be in (0, 1), got {factor}"),
            ));
        }
        policy.collision_avoidance_factor = Some(factor);
    }
    if let Some(predicate) = &overrides.retry_while {
        policy.retry_while = Some(ctx.predicate(predicate)?);
    }
    if let Some(async_delayed) = overrides.async_delayed_redelivery {
        policy.async_delayed_redelivery = async_delayed;
    }
    Ok(policy)
}
