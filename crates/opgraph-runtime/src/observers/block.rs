use std::sync::Arc;

use opgraph_core::OpError;

use super::Observer;
use crate::unit::TaskUnit;

type StartHandler = Arc<dyn Fn(&TaskUnit) + Send + Sync>;
type ProduceHandler = Arc<dyn Fn(&TaskUnit, &TaskUnit) + Send + Sync>;
type FinishHandler = Arc<dyn Fn(&TaskUnit, &[OpError]) + Send + Sync>;

/// Observer built from optional closures.
#[derive(Clone, Default)]
pub struct BlockObserver {
    start: Option<StartHandler>,
    produce: Option<ProduceHandler>,
    finish: Option<FinishHandler>,
}

impl BlockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, handler: impl Fn(&TaskUnit) + Send + Sync + 'static) -> Self {
        self.start = Some(Arc::new(handler));
        self
    }

    pub fn on_produce(
        mut self,
        handler: impl Fn(&TaskUnit, &TaskUnit) + Send + Sync + 'static,
    ) -> Self {
        self.produce = Some(Arc::new(handler));
        self
    }

    pub fn on_finish(
        mut self,
        handler: impl Fn(&TaskUnit, &[OpError]) + Send + Sync + 'static,
    ) -> Self {
        self.finish = Some(Arc::new(handler));
        self
    }
}

impl Observer for BlockObserver {
    fn did_start(&self, unit: &TaskUnit) {
        if let Some(handler) = &self.start {
            handler(unit);
        }
    }

    fn did_produce(&self, unit: &TaskUnit, produced: &TaskUnit) {
        if let Some(handler) = &self.produce {
            handler(unit, produced);
        }
    }

    fn did_finish(&self, unit: &TaskUnit, errors: &[OpError]) {
        if let Some(handler) = &self.finish {
            handler(unit, errors);
        }
    }
}
