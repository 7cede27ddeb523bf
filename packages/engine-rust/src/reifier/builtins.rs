//! Factories for the built-in definition kinds.

use std::sync::Arc;
use std::time::Duration;

use routeflow_core::expression::UseLatest;
use routeflow_core::SharedProcessor;

use super::{CompileContext, Reifier};
use crate::definition::{
    DefinitionKind, HasExecutorRef, HasExpression, MaxRequests, Node, ProcessorDefinition,
};
use crate::error::{CompileError, CompileResult};
use crate::processor::{
    CatchClause, ChoiceProcessor, FilterProcessor, MulticastMode, MulticastProcessor,
    SendProcessor, SetBodyProcessor, SetHeaderProcessor, StopProcessor, ThrottleOptions,
    ThrottleProcessor, ThrottleRate, TryProcessor,
};

pub(super) fn register_all(reifier: &Reifier) {
    reifier.register(DefinitionKind::PIPELINE, pipeline);
    reifier.register(DefinitionKind::CHOICE, choice);
    reifier.register(DefinitionKind::WHEN, filter);
    reifier.register(DefinitionKind::OTHERWISE, |def: &ProcessorDefinition, _: &CompileContext<'_>| {
        Err(CompileError::invalid(def.label(), "otherwise is only valid inside a choice"))
    });
    reifier.register(DefinitionKind::MULTICAST, multicast);
    reifier.register(DefinitionKind::THROTTLE, throttle);
    reifier.register(DefinitionKind::TRY, try_catch);
    reifier.register(DefinitionKind::CATCH, |def: &ProcessorDefinition, _: &CompileContext<'_>| {
        Err(CompileError::invalid(def.label(), "catch is only valid inside a try"))
    });
    reifier.register(DefinitionKind::FINALLY, |def: &ProcessorDefinition, _: &CompileContext<'_>| {
        Err(CompileError::invalid(def.label(), "finally is only valid inside a try"))
    });
    reifier.register(DefinitionKind::TO, to);
    reifier.register(DefinitionKind::PROCESS, process);
    reifier.register(DefinitionKind::SET_HEADER, set_header);
    reifier.register(DefinitionKind::SET_BODY, set_body);
    reifier.register(DefinitionKind::STOP, |_: &ProcessorDefinition, _: &CompileContext<'_>| {
        Ok(Arc::new(StopProcessor) as SharedProcessor)
    });
}

/// The factory was registered for one kind but handed another.
fn mismatch(def: &ProcessorDefinition, expected: &DefinitionKind) -> CompileError {
    CompileError::invalid(def.label(), format!("factory for '{expected}' cannot build this node"))
}

fn pipeline(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    ctx.compile_pipeline(def.outputs())
}

fn choice(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::Choice(choice) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::CHOICE));
    };
    let mut whens = Vec::with_capacity(choice.whens.len());
    for when in &choice.whens {
        let predicate = when
            .predicate
            .as_ref()
            .ok_or_else(|| CompileError::missing_field(def.label(), "when.predicate"))?;
        whens.push((ctx.predicate(predicate)?, ctx.compile_pipeline(&when.outputs)?));
    }
    let otherwise = choice
        .otherwise
        .as_ref()
        .map(|o| ctx.compile_pipeline(&o.outputs))
        .transpose()?;
    Ok(Arc::new(ChoiceProcessor::new(whens, otherwise)))
}

fn filter(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::When(when) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::WHEN));
    };
    let predicate = when
        .predicate
        .as_ref()
        .ok_or_else(|| CompileError::missing_field(def.label(), "predicate"))?;
    Ok(Arc::new(FilterProcessor::new(
        ctx.predicate(predicate)?,
        ctx.compile_pipeline(&when.outputs)?,
    )))
}

fn multicast(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::Multicast(multicast) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::MULTICAST));
    };
    let label = def.label();
    if multicast.parallel && multicast.share_exchange {
        return Err(CompileError::invalid(
            label,
            "share_exchange requires sequential processing",
        ));
    }
    let strategy = match &multicast.strategy {
        Some(strategy) => ctx.strategy(strategy)?,
        None => Arc::new(UseLatest),
    };
    let mode = if multicast.parallel {
        MulticastMode::Parallel(ctx.pool(multicast.executor_ref(), &label)?)
    } else if multicast.share_exchange {
        MulticastMode::SharedExchange
    } else {
        MulticastMode::Sequential
    };
    let branches = ctx.compile_outputs(&multicast.outputs)?;
    Ok(Arc::new(MulticastProcessor::new(
        label,
        branches,
        strategy,
        mode,
        multicast.stop_on_exception,
    )))
}

fn throttle(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::Throttle(throttle) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::THROTTLE));
    };
    let label = def.label();
    let rate = match &throttle.max_requests {
        None => return Err(CompileError::missing_field(label, "max_requests")),
        Some(MaxRequests::Fixed(param)) => {
            let max = ctx.param(param, &label, "max_requests")?;
            if max == 0 {
                return Err(CompileError::invalid(label, "max_requests must be greater than zero"));
            }
            ThrottleRate::Fixed(max)
        }
        Some(MaxRequests::Dynamic(expression)) => ThrottleRate::Dynamic(ctx.expression(expression)?),
    };
    let period_ms = ctx.param(&throttle.time_period, &label, "time_period")?;
    if period_ms == 0 {
        return Err(CompileError::invalid(label, "time_period must be greater than zero"));
    }
    let correlation = throttle
        .expression()
        .map(|expression| ctx.expression(expression))
        .transpose()?;
    let async_pool = if throttle.async_delayed {
        Some(ctx.pool(throttle.executor_ref(), &label)?)
    } else {
        None
    };
    let output = ctx.compile_pipeline(&throttle.outputs)?;
    Ok(Arc::new(ThrottleProcessor::new(
        label,
        output,
        rate,
        Duration::from_millis(period_ms),
        ThrottleOptions {
            correlation,
            reject_execution: throttle.reject_execution,
            async_pool,
            caller_runs_when_rejected: throttle.caller_runs_when_rejected,
            idle_periods: ctx.throttle_idle_periods(),
        },
    )))
}

fn try_catch(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::Try(definition) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::TRY));
    };
    if definition.catches.is_empty() && definition.finally.is_none() {
        return Err(CompileError::invalid(
            def.label(),
            "requires at least one catch or a finally",
        ));
    }
    let body = ctx.compile_pipeline(&definition.outputs)?;
    let mut catches = Vec::with_capacity(definition.catches.len());
    for catch in &definition.catches {
        let on_when = catch
            .on_when
            .as_ref()
            .map(|predicate| ctx.predicate(predicate))
            .transpose()?;
        catches.push(CatchClause::new(
            catch.exceptions.clone(),
            on_when,
            ctx.compile_pipeline(&catch.outputs)?,
        ));
    }
    let finally = definition
        .finally
        .as_ref()
        .map(|f| ctx.compile_pipeline(&f.outputs))
        .transpose()?;
    Ok(Arc::new(TryProcessor::new(body, catches, finally)))
}

/// Resolves `uri` and wraps a producer for it.
pub(super) fn send_to(uri: &str, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let uri = ctx.resolve(uri)?;
    let endpoint = ctx.endpoints().resolve(&uri)?;
    let producer = endpoint
        .create_producer()
        .map_err(|source| CompileError::Endpoint { uri, source })?;
    Ok(Arc::new(SendProcessor::new(producer)))
}

fn to(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::To(to) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::TO));
    };
    if to.uri.trim().is_empty() {
        return Err(CompileError::missing_field(def.label(), "uri"));
    }
    send_to(&to.uri, ctx)
}

fn process(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::Process(process) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::PROCESS));
    };
    let reference = process
        .processor
        .as_ref()
        .ok_or_else(|| CompileError::missing_field(def.label(), "processor"))?;
    ctx.processor(reference)
}

fn set_header(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::SetHeader(header) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::SET_HEADER));
    };
    let name = ctx.resolve(&header.name)?;
    if name.is_empty() {
        return Err(CompileError::missing_field(def.label(), "name"));
    }
    let expression = header
        .expression()
        .ok_or_else(|| CompileError::missing_field(def.label(), "expression"))?;
    Ok(Arc::new(SetHeaderProcessor::new(name, ctx.expression(expression)?)))
}

fn set_body(def: &ProcessorDefinition, ctx: &CompileContext<'_>) -> CompileResult<SharedProcessor> {
    let Node::SetBody(body) = &def.node else {
        return Err(mismatch(def, &DefinitionKind::SET_BODY));
    };
    let expression = body
        .expression()
        .ok_or_else(|| CompileError::missing_field(def.label(), "expression"))?;
    Ok(Arc::new(SetBodyProcessor::new(ctx.expression(expression)?)))
}
