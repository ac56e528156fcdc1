mod cli;
mod config;
mod daemon;
mod db;
mod error;
mod guard;
mod index;
mod lesson;
mod models;
mod notifier;
mod orchestrator;
mod progress;
mod provider;
mod server;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Commands, CourseCommands, IndexCommands, LessonCommands};
use crate::config::{load_config, validate_config};
use crate::models::LessonKey;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    let command = match cli.command {
        None => return daemon::run(config).await,
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
            return Ok(());
        }
        Some(command) => command,
    };

    let services = daemon::build_services(&config).await?;
    let o = &services.orchestrator;

    match command {
        Commands::Course { command } => match command {
            CourseCommands::Create {
                topic,
                language,
                subtopics,
            } => {
                let course = o.create_course(&topic, language.as_deref(), subtopics).await?;
                println!("{}", course.id);
            }
            CourseCommands::Show { course_id } => print_json(&o.course(&course_id).await?)?,
        },
        Commands::Index { command } => match command {
            IndexCommands::Build { course_id, subtopics } => {
                print_json(&o.build_index(&course_id, subtopics, Vec::new()).await?)?;
            }
            IndexCommands::Regenerate { course_id } => print_json(&o.regenerate_index(&course_id).await?)?,
        },
        Commands::Lesson { command } => match command {
            LessonCommands::Generate {
                course_id,
                subtopic_id,
                lesson_id,
            } => {
                let key = LessonKey::new(course_id, subtopic_id, lesson_id);
                print_json(&o.generate_lesson(&key).await?)?;
            }
            LessonCommands::ChangeVideo {
                course_id,
                subtopic_id,
                lesson_id,
            } => {
                let key = LessonKey::new(course_id, subtopic_id, lesson_id);
                print_json(&o.change_video(&key).await?)?;
            }
        },
        Commands::Validate => {}
    }

    services.pool.close().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}
