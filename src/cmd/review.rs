//! Checkpoint review and promotion: `foreman review|promote`.

use anyhow::Result;

use foreman::config::Config;
use foreman::errors::PromoteError;
use foreman::promote::{PromoteRequest, ReviewAction};

use super::Services;

pub async fn cmd_review(
    config: &Config,
    checkpoint_id: &str,
    action: ReviewAction,
    reviewer: Option<&str>,
    notes: Option<&str>,
) -> Result<()> {
    let services = Services::open(config)?;
    let checkpoint = services
        .promote
        .review_checkpoint(checkpoint_id, action, reviewer, notes)
        .await?;
    println!(
        "Checkpoint {} is now {}",
        checkpoint.id,
        checkpoint.review_status.as_str()
    );
    Ok(())
}

pub async fn cmd_promote(config: &Config, task_id: &str, request: PromoteRequest) -> Result<()> {
    let services = Services::open(config)?;
    match services.promote.promote(task_id, request).await {
        Ok(promotion) => {
            println!();
            println!(
                "Promoted {} onto {} ({})",
                promotion.task_id,
                promotion.target_branch,
                promotion.strategy.as_str()
            );
            println!("Merge commit: {}", promotion.merge_commit);
            println!(
                "{} file(s) changed, {} insertion(s), {} deletion(s)",
                promotion.stats.files_changed, promotion.stats.insertions, promotion.stats.deletions
            );
            println!();
            Ok(())
        }
        Err(PromoteError::Conflicts { files, message }) => {
            println!("Merge conflicts:");
            for file in &files {
                println!("  {}", file);
            }
            anyhow::bail!("Promotion aborted: {}", message)
        }
        Err(e) => Err(e.into()),
    }
}
