/// Options for one `run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only the single task whose path was passed verbatim, skipping its dependencies.
    pub only: bool,

    /// Run dependents before their dependencies.
    pub reverse: bool,

    /// Keep only tasks carrying at least one of these tags (empty keeps everything)
    pub only_tags: Vec<String>,

    /// Maximum parallel tasks (overrides config if Some)
    pub concurrency: Option<usize>,

    /// Hand the terminal's stdin to the task. Sequential runs only.
    pub interactive: bool,

    /// Run this custom function instead of `run`
    pub custom_function: Option<String>,

    /// Tell tasks not to apply changes
    pub dry_run: bool,

    /// Print the plan instead of executing it
    pub graph: bool,
}

impl RunOptions {
    pub fn effective_concurrency(&self, configured: usize) -> usize {
        self.concurrency.unwrap_or(configured).max(1)
    }
}
