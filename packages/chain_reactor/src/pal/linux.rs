use std::num::NonZero;
use std::sync::Arc;

use crate::EventEngine;

mod bindings;
pub(crate) use bindings::*;

mod epoll_engine;
pub(crate) use epoll_engine::*;

/// The engine backing every scheduler built for this target.
pub(crate) fn build_target_engine(max_events: NonZero<usize>) -> Arc<dyn EventEngine> {
    Arc::new(EpollEventEngine::new(BindingsFacade::target(), max_events))
}
