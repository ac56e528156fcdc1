use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lessonforge", about = "Course indexes, on-demand lessons and video assignment")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Course management
    Course {
        #[command(subcommand)]
        command: CourseCommands,
    },

    /// Build or regenerate a course index
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Lesson generation
    Lesson {
        #[command(subcommand)]
        command: LessonCommands,
    },
}

#[derive(Subcommand)]
pub enum CourseCommands {
    /// Create a course and print its id
    Create {
        #[arg(long)]
        topic: String,

        /// Language code; defaults to [provider].language_default
        #[arg(long)]
        language: Option<String>,

        /// Number of subtopics
        #[arg(long)]
        subtopics: u32,
    },
    /// Print a course as JSON
    Show { course_id: String },
}

#[derive(Subcommand)]
pub enum IndexCommands {
    /// Build the index (spends a regeneration if one already exists)
    Build {
        course_id: String,

        /// Override the course's subtopic count
        #[arg(long)]
        subtopics: Option<u32>,
    },
    /// Regenerate an existing index
    Regenerate { course_id: String },
}

#[derive(Subcommand)]
pub enum LessonCommands {
    /// Generate content and the first video for a lesson
    Generate {
        course_id: String,
        subtopic_id: String,
        lesson_id: String,
    },
    /// Replace the lesson's current video
    ChangeVideo {
        course_id: String,
        subtopic_id: String,
        lesson_id: String,
    },
}
