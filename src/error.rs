use thiserror::Error;

/// Application-boundary error carrying the process exit code.
///
/// Exit codes:
/// - `2`: input or configuration problems (bad CSV, bad env values)
/// - `4`: fitting failures that abort the analysis
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        AppError::new(4, format!("Fit failed: {err}"))
    }
}

/// Failures raised by the curve and mixed-model fitters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// Fewer observations than free parameters.
    #[error("insufficient data: {observations} observations for {parameters} free parameters")]
    InsufficientData { observations: usize, parameters: usize },

    /// The optimizer ran out of budget or could not reduce the residuals.
    #[error("fit diverged after {evaluations} evaluations: {reason}")]
    Divergence { evaluations: usize, reason: String },

    /// The Jacobian is rank deficient at the solution (non-identifiable parameters).
    #[error("singular gradient: {0}")]
    SingularGradient(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
