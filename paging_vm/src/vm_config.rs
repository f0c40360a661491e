/// Tunables of a [`crate::Vm`] instance
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Number of physical frames in the user pool
    pub user_frames: usize,

    /// Maximum number of pages the user stack may grow to.
    ///
    /// This is the only stack ceiling, an access below it terminates the process.
    pub max_stack_pages: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: 64,
            // 1 MiB
            max_stack_pages: 256,
        }
    }
}
