//! Quiz and attempt calls. These are plain collaborators of the session:
//! everything auth-related happens in the pipeline underneath them.

use super::{ApiClient, ApiError};
use crate::models::{Attempt, Quiz};

const QUIZZES_PATH: &str = "/api/quiz";
const AVAILABLE_QUIZZES_PATH: &str = "/api/quiz/available";
const MY_ATTEMPTS_PATH: &str = "/api/attempt/my";

impl ApiClient {
    /// Quizzes owned by the signed-in teacher
    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>, ApiError> {
        self.get(QUIZZES_PATH).await
    }

    /// Quizzes a student can take
    pub async fn available_quizzes(&self) -> Result<Vec<Quiz>, ApiError> {
        self.get(AVAILABLE_QUIZZES_PATH).await
    }

    /// The signed-in student's attempts, newest first
    pub async fn my_attempts(&self) -> Result<Vec<Attempt>, ApiError> {
        let mut attempts: Vec<Attempt> = self.get(MY_ATTEMPTS_PATH).await?;
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }
}
