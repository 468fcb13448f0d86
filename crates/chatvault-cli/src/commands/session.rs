//! Session management commands.

use std::str::FromStr;

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};

use chatvault_core::{Error, Session};
use chatvault_session::{
    validate_checkpoint_file, CheckpointFormat, ExportOptions, ImportOptions, SessionError,
};

use crate::{AppContext, SessionAction};

pub async fn handle(action: SessionAction, ctx: &AppContext) -> anyhow::Result<()> {
    let manager = ctx.manager()?;

    match action {
        SessionAction::List { limit } => {
            let sessions = manager.list_sessions(limit).await.map_err(Error::from)?;

            if sessions.is_empty() {
                println!("No sessions found for {}", manager.project_path());
                return Ok(());
            }

            println!("Sessions ({}):", sessions.len());
            println!();
            for session in &sessions {
                println!("  {}", format_session_summary(session));
            }
            println!();
            println!("Use 'chatvault session show <name>' for details");
        }

        SessionAction::Show { name, limit } => {
            let session = manager.get_session_by_name(&name).await.map_err(Error::from)?;
            let history = manager
                .get_messages_with_compaction(&ctx.cancel, &session.id, limit)
                .await
                .map_err(Error::from)?;

            println!("Session: {}", session.name);
            println!("================================================================================");
            println!();
            println!("ID:          {}", session.id);
            println!("Provider:    {}", session.provider);
            println!("Model:       {}", session.model);
            if !session.agent.is_empty() {
                println!("Agent:       {}", session.agent);
            }
            println!("Project:     {}", session.project_path);
            println!("Created:     {}", format_time(&session.created_at));
            println!("Updated:     {}", format_time(&session.updated_at));
            println!("Messages:    {}", session.message_count);

            if !history.is_empty() {
                println!();
                println!("History:");
                println!("--------");
                for msg in &history {
                    let label = if msg.is_summary { "summary" } else { msg.role.as_str() };
                    println!("[{}] {}: {}", format_time(&msg.created_at), label, msg.content);
                }
            }
        }

        SessionAction::Delete { name } => {
            let session = manager.get_session_by_name(&name).await.map_err(Error::from)?;
            manager.delete_session(&session.id).await.map_err(Error::from)?;
            println!("Deleted session: {}", name);
        }

        SessionAction::Clean { older_than } => {
            let older_than = older_than.unwrap_or_default();
            let age = parse_duration(&older_than, ctx.config.storage.retention_days)?;
            let deleted = manager.clean_old_sessions(age).await.map_err(Error::from)?;
            println!("Deleted {} session(s) older than {} day(s)", deleted, age.num_days());
        }

        SessionAction::Compact { name } => {
            let session = manager.get_session_by_name(&name).await.map_err(Error::from)?;
            match manager
                .compact_session(&ctx.cancel, &session.id, true)
                .await
                .map_err(Error::from)?
            {
                Some(outcome) => {
                    println!(
                        "Compacted {} message(s) into summary {} (~{} tokens, {})",
                        outcome.messages_compacted,
                        outcome.summary_id,
                        outcome.token_count,
                        if outcome.ai_generated { "AI" } else { "simple" }
                    );
                }
                None => println!("Nothing to compact in session: {}", name),
            }
        }

        SessionAction::Export {
            name,
            output,
            format,
            context,
            metadata,
        } => {
            let format = format
                .as_deref()
                .map(CheckpointFormat::from_str)
                .transpose()
                .map_err(Error::from)?;
            let options = ExportOptions {
                format,
                include_metadata: metadata,
                include_context: context,
                exported_by: std::env::var("USER").ok().filter(|u| !u.is_empty()),
            };

            let checkpoint = manager
                .export_session_by_name(&name, &output, &options)
                .await
                .map_err(Error::from)?;
            println!(
                "Exported {} message(s) from '{}' to {}",
                checkpoint.messages.len(),
                name,
                output.display()
            );
        }

        SessionAction::Import {
            file,
            name,
            overwrite,
            context,
        } => {
            let options = ImportOptions {
                name,
                project_path: None,
                overwrite,
                include_context: context,
            };

            let session = manager
                .import_session(&ctx.cancel, &file, &options)
                .await
                .map_err(Error::from)?;
            println!(
                "Imported session '{}' ({} message(s)) from {}",
                session.name,
                session.message_count,
                file.display()
            );
        }

        SessionAction::Validate { file } => match validate_checkpoint_file(&file) {
            Ok(checkpoint) => {
                println!("Valid checkpoint: {}", file.display());
                println!("  Version:  {}", checkpoint.version);
                println!("  Session:  {}", checkpoint.session.name);
                println!("  Messages: {}", checkpoint.messages.len());
            }
            Err(SessionError::Validation(e)) => {
                bail!("Invalid checkpoint {}: {}", file.display(), e);
            }
            Err(e) => return Err(Error::from(e).into()),
        },
    }

    Ok(())
}

/// Parse a retention duration like `30d`, `2w`, `6m` or `12h`.
///
/// Weeks are 7 days, months 30 days, and hours round up to whole days.
/// An empty string selects `default_days`.
pub fn parse_duration(raw: &str, default_days: u32) -> anyhow::Result<chrono::Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(chrono::Duration::days(i64::from(default_days)));
    }

    let split = raw.len() - raw.chars().last().map_or(0, char::len_utf8);
    let (number, unit) = raw.split_at(split);
    let n: i64 = number
        .parse()
        .with_context(|| format!("invalid duration '{}': expected a number followed by d, w, m or h", raw))?;
    if n < 0 {
        bail!("invalid duration '{}': must not be negative", raw);
    }

    let days = match unit {
        "d" => Some(n),
        "w" => n.checked_mul(7),
        "m" => n.checked_mul(30),
        "h" => Some(n / 24 + i64::from(n % 24 != 0)),
        other => bail!("invalid duration unit '{}' in '{}': expected d, w, m or h", other, raw),
    };

    days.and_then(chrono::Duration::try_days)
        .ok_or_else(|| anyhow::anyhow!("invalid duration '{}': out of range", raw))
}

fn format_time(dt: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = dt.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M").to_string()
}

fn format_session_summary(session: &Session) -> String {
    format!(
        "{:<24} {:>5} msgs  {}/{}  {}",
        session.name,
        session.message_count,
        session.provider,
        session.model,
        format_time(&session.updated_at)
    )
}
