//! Hook Dispatcher (SPEC §4.C): ordered invocation of user and plugin
//! callbacks at the ten named lifecycle points. Firing order for one point is
//! always before-plugin-user-hooks -> plugin-registry hooks -> after-plugin-user-hooks,
//! and a failing callback aborts the rest of that pipeline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bus_plugin_core::{HookContext, HookIssue, HookPoint, BusHook, HookReport};

#[derive(Clone, Default)]
pub struct HookConfig {
    before_plugins: Vec<(HookPoint, Arc<dyn BusHook>)>,
    plugins: Vec<(HookPoint, Arc<dyn BusHook>)>,
    after_plugins: Vec<(HookPoint, Arc<dyn BusHook>)>,
}

impl std::fmt::Debug for HookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookConfig")
            .field("before_plugins", &names(&self.before_plugins))
            .field("plugins", &names(&self.plugins))
            .field("after_plugins", &names(&self.after_plugins))
            .finish()
    }
}

impl HookConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before_plugin_hook(mut self, point: HookPoint, hook: Arc<dyn BusHook>) -> Self {
        self.before_plugins.push((point, hook));
        self
    }

    pub fn with_plugin_hook(mut self, point: HookPoint, hook: Arc<dyn BusHook>) -> Self {
        self.plugins.push((point, hook));
        self
    }

    pub fn with_after_plugin_hook(mut self, point: HookPoint, hook: Arc<dyn BusHook>) -> Self {
        self.after_plugins.push((point, hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.before_plugins.is_empty() && self.plugins.is_empty() && self.after_plugins.is_empty()
    }
}

fn names(hooks: &[(HookPoint, Arc<dyn BusHook>)]) -> Vec<(&'static str, &'static str)> {
    hooks
        .iter()
        .map(|(point, hook)| (point.as_str(), hook.name()))
        .collect()
}

type Slots = HashMap<HookPoint, Vec<Arc<dyn BusHook>>>;

pub struct HookDispatcher {
    before_plugins: RwLock<Slots>,
    plugins: RwLock<Slots>,
    after_plugins: RwLock<Slots>,
    latest_report: RwLock<HookReport>,
}

impl HookDispatcher {
    pub fn new(config: HookConfig) -> Self {
        let dispatcher = Self {
            before_plugins: RwLock::new(HashMap::new()),
            plugins: RwLock::new(HashMap::new()),
            after_plugins: RwLock::new(HashMap::new()),
            latest_report: RwLock::new(HookReport::default()),
        };
        dispatcher.register(config);
        dispatcher
    }

    pub fn register(&self, config: HookConfig) {
        insert_all(&self.before_plugins, config.before_plugins);
        insert_all(&self.plugins, config.plugins);
        insert_all(&self.after_plugins, config.after_plugins);
    }

    pub fn report_snapshot(&self) -> HookReport {
        read(&self.latest_report).clone()
    }

    /// Run the three pipelines for `ctx.point` in order. The first callback
    /// that returns `Err` is recorded in the report and aborts the remaining
    /// pipelines, propagating the issue to the caller so it can abort the
    /// operation that fired the hook (SPEC §4.C).
    pub async fn fire(&self, ctx: &HookContext) -> Result<(), HookIssue> {
        let point = ctx.point;
        let mut report = self.report_snapshot();
        let result = self.fire_inner(point, ctx, &mut report).await;
        *write(&self.latest_report) = report;
        result
    }

    async fn fire_inner(
        &self,
        point: HookPoint,
        ctx: &HookContext,
        report: &mut HookReport,
    ) -> Result<(), HookIssue> {
        for hook in slot_hooks(&self.before_plugins, point) {
            run_one(&hook, ctx).await.map_err(|issue| record(report, issue))?;
        }
        for hook in slot_hooks(&self.plugins, point) {
            run_one(&hook, ctx).await.map_err(|issue| record(report, issue))?;
        }
        for hook in slot_hooks(&self.after_plugins, point) {
            run_one(&hook, ctx).await.map_err(|issue| record(report, issue))?;
        }
        Ok(())
    }
}

async fn run_one(hook: &Arc<dyn BusHook>, ctx: &HookContext) -> Result<(), HookIssue> {
    hook.call(ctx).await
}

fn record(report: &mut HookReport, issue: HookIssue) -> HookIssue {
    report.push(issue.clone());
    issue
}

fn slot_hooks(target: &RwLock<Slots>, point: HookPoint) -> Vec<Arc<dyn BusHook>> {
    read(target).get(&point).cloned().unwrap_or_default()
}

fn insert_all(target: &RwLock<Slots>, incoming: Vec<(HookPoint, Arc<dyn BusHook>)>) {
    if incoming.is_empty() {
        return;
    }
    let mut guard = write(target);
    for (point, hook) in incoming {
        let bucket = guard.entry(point).or_default();
        if !bucket.iter().any(|existing| existing.name() == hook.name()) {
            bucket.push(hook);
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests;
