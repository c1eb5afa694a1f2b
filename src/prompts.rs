//! Task prompts sent alongside each rendered variant.
//!
//! Every variant is judged on three tasks. The prompts are fixed strings so
//! that a model's results on two variants differ only because the pages
//! differ. Editing a prompt invalidates comparisons with earlier runs; bump
//! the scorer version when you do.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transcription task prompt.
pub const TRANSCRIPTION_PROMPT: &str = "Transcribe the text from the document.";

/// Solving task prompt.
pub const SOLVING_PROMPT: &str = "Identify the main math or coding problem in this document and solve it. \
Show your work and explain your solution.";

/// Explanation task prompt.
pub const EXPLANATION_PROMPT: &str = "Explain the concept being tested in this document and provide a \
detailed explanation of the problem and solution.";

/// Appended to every prompt so that text-first models look at the image.
pub const VISION_SUFFIX: &str = " I am providing you with an image of a document. \
Please analyze the visual content of this image.";

/// System message for all tasks.
pub const SYSTEM_PROMPT: &str = "You are a careful assistant reading scanned exam pages. \
Answer from what the pages show.";

/// What the model is asked to do with a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Transcription,
    Solving,
    Explanation,
}

impl Task {
    pub const ALL: [Task; 3] = [Task::Transcription, Task::Solving, Task::Explanation];

    pub fn name(self) -> &'static str {
        match self {
            Task::Transcription => "transcription",
            Task::Solving => "solving",
            Task::Explanation => "explanation",
        }
    }

    /// Full user prompt, vision suffix included.
    pub fn prompt(self) -> String {
        let base = match self {
            Task::Transcription => TRANSCRIPTION_PROMPT,
            Task::Solving => SOLVING_PROMPT,
            Task::Explanation => EXPLANATION_PROMPT,
        };
        format!("{base}{VISION_SUFFIX}")
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transcription" | "transcribe" => Ok(Task::Transcription),
            "solving" | "solve" => Ok(Task::Solving),
            "explanation" | "explain" => Ok(Task::Explanation),
            other => Err(format!(
                "unknown task '{other}' (expected transcription, solving or explanation)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_vision_suffix() {
        for task in Task::ALL {
            let p = task.prompt();
            assert!(p.ends_with("visual content of this image."), "{task}: {p}");
        }
        assert!(Task::Solving.prompt().starts_with("Identify the main math"));
    }

    #[test]
    fn task_names_parse() {
        assert_eq!("solve".parse::<Task>().unwrap(), Task::Solving);
        assert_eq!("Explanation".parse::<Task>().unwrap(), Task::Explanation);
        assert!("summarise".parse::<Task>().is_err());
    }
}
