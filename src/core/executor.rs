//! Experiment callbacks and the arguments they receive.

use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::core::context::TaskContext;
use crate::core::AppResult;

/// Named arguments built from one table row.
///
/// Holds every column of the row except the identifier, plus any extra
/// arguments configured on the runner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowArgs(Map<String, Value>);

impl RowArgs {
    /// Wrap a map of column values.
    pub const fn new(values: Map<String, Value>) -> Self {
        Self(values)
    }

    /// Value of column `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Text value of column `name`.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Deserialize the row into `T`. Columns `T` does not name are ignored.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    /// Add entries that are not already present.
    pub(crate) fn merge_missing(&mut self, extra: &Map<String, Value>) {
        for (key, value) in extra {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for RowArgs {
    fn from(values: Map<String, Value>) -> Self {
        Self(values)
    }
}

/// User experiment run once per pending row.
///
/// Implementations acquire resources, launch programs and report metrics
/// through the [`TaskContext`]. The returned value is stored in the runner's
/// return-value column. Errors are logged and recorded as an empty result
/// without affecting sibling rows.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use ml_scheduler::core::{Experiment, RowArgs, TaskContext, AppResult};
///
/// struct Train;
///
/// #[async_trait]
/// impl Experiment for Train {
///     async fn run(&self, ctx: TaskContext, args: RowArgs) -> AppResult<serde_json::Value> {
///         let lr = args.get("lr").cloned().unwrap_or_default();
///         ctx.report([("loss", lr)]).await?;
///         Ok(serde_json::Value::Null)
///     }
/// }
/// ```
#[async_trait]
pub trait Experiment: Send + Sync + 'static {
    /// Run the experiment for one row.
    async fn run(&self, ctx: TaskContext, args: RowArgs) -> AppResult<Value>;
}

/// Experiment backed by an async closure.
pub struct FnExperiment<F>(F);

/// Wrap an async closure as an [`Experiment`].
pub fn experiment_fn<F, Fut>(f: F) -> FnExperiment<F>
where
    F: Fn(TaskContext, RowArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<Value>> + Send + 'static,
{
    FnExperiment(f)
}

#[async_trait]
impl<F, Fut> Experiment for FnExperiment<F>
where
    F: Fn(TaskContext, RowArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<Value>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext, args: RowArgs) -> AppResult<Value> {
        (self.0)(ctx, args).await
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize)]
    struct Hyper {
        lr: f64,
        #[serde(default)]
        epochs: Option<u32>,
    }

    #[test]
    fn parse_ignores_extra_columns() {
        let mut map = Map::new();
        map.insert("lr".into(), json!(0.01));
        map.insert("notes".into(), json!("baseline"));
        let args = RowArgs::new(map);

        let hyper: Hyper = args.parse().unwrap();
        assert!((hyper.lr - 0.01).abs() < f64::EPSILON);
        assert_eq!(hyper.epochs, None);
        assert_eq!(args.get_str("notes"), Some("baseline"));
    }

    #[test]
    fn merge_keeps_row_values() {
        let mut args = RowArgs::new(Map::from_iter([("seed".to_string(), json!(1))]));
        let extra = Map::from_iter([
            ("seed".to_string(), json!(99)),
            ("device".to_string(), json!("cuda")),
        ]);
        args.merge_missing(&extra);
        assert_eq!(args.get("seed"), Some(&json!(1)));
        assert_eq!(args.get_str("device"), Some("cuda"));
    }
}
