#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("Not in a git repository")]
    NotInRepository,

    #[error("Worktree not found at path: {path}")]
    WorktreeNotFound { path: String },

    #[error("Failed to remove worktree at {path}: {message}")]
    WorktreeRemovalFailed { path: String, message: String },

    #[error("No changes to merge")]
    NothingToMerge,

    #[error("Failed to commit worktree changes: {message}")]
    CommitFailed { message: String },

    #[error("Failed to checkout branch '{branch}': {message}")]
    CheckoutFailed { branch: String, message: String },

    #[error("Merge failed: {message}")]
    MergeFailed { message: String },

    #[error("No merge in progress")]
    NoMergeInProgress,

    #[error("Unresolved conflicts remain")]
    ConflictsRemain,

    #[error("Git operation failed: {message}")]
    OperationFailed { message: String },

    #[error("IO error during git operation: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}
