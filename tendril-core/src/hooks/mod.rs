mod dispatcher;
mod types;

pub use dispatcher::HookDispatcher;

pub use types::{
    DispatchMode, DispatchOutcome, FanOutReport, HandlerOutcome, HookContext, HookDefinition,
    HookExecution, HookInfo, HookResult, PipelineFailure, PipelineReport, SubscriberInfo,
};
