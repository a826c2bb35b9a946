use std::path::{Path, PathBuf};

use super::*;
use crate::db::ExecutionPatch;
use crate::models::{ExecutionMode, ExecutionStatus, Stream};
use crate::tasks::{MemoryTaskStore, TaskInfo};
use crate::test_support::{TestRepo, commit_file};
use crate::worktree::NewExecution;

struct Fixture {
    repo: TestRepo,
    tasks: Arc<MemoryTaskStore>,
    service: PromoteService,
}

impl Fixture {
    async fn new(tasks: Vec<TaskInfo>) -> Self {
        let repo = TestRepo::new().await;
        let tasks = Arc::new(MemoryTaskStore::new(tasks));
        let service = PromoteService::new(repo.db.clone(), tasks.clone(), repo.path().to_path_buf());
        Self {
            repo,
            tasks,
            service,
        }
    }

    /// Run `task` in its own worktree, commit `files`, and record a
    /// checkpoint for the result.
    async fn completed_task(&self, task: &str, files: &[(&str, &str)]) -> Checkpoint {
        let exec = self
            .repo
            .worktree_manager()
            .create_execution_with_worktree(NewExecution {
                task_id: Some(task.into()),
                title: Some(format!("Task {}", task)),
                agent_type: "claude".into(),
                mode: ExecutionMode::Worktree,
                isolation_branch: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let dir = PathBuf::from(exec.worktree_path.clone().unwrap());
        let mut head = String::new();
        for (name, content) in files {
            head = commit_file(&dir, name, content).await;
        }
        let before = exec.before_commit.clone().unwrap();
        let stats = GitTracker::new(&dir).unwrap().diff_stats(&before, &head).unwrap();

        let stream = Stream {
            id: uuid::Uuid::new_v4().to_string(),
            parent_stream: None,
            name: task.into(),
            created_at: Utc::now(),
        };
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream.id.clone(),
            execution_id: Some(exec.id.clone()),
            task_id: Some(task.into()),
            commit_sha: head.clone(),
            parent_commit: Some(before),
            stats,
            checkpointed_at: Utc::now(),
            review_status: ReviewStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
        };
        let (exec_id, cp) = (exec.id.clone(), checkpoint.clone());
        self.repo
            .db
            .call(move |db| {
                db.update_execution(
                    &exec_id,
                    &ExecutionPatch {
                        status: Some(ExecutionStatus::Completed),
                        after_commit: Some(head),
                        ..Default::default()
                    },
                )?;
                db.insert_stream(&stream, None)?;
                db.insert_checkpoint(&cp)
            })
            .await
            .unwrap();
        checkpoint
    }

    async fn approve(&self, checkpoint: &Checkpoint) {
        self.service
            .review_checkpoint(&checkpoint.id, ReviewAction::Approve, Some("alice"), None)
            .await
            .unwrap();
    }

    fn path(&self) -> &Path {
        self.repo.path()
    }
}

#[tokio::test]
async fn test_review_transitions() {
    let fx = Fixture::new(vec![TaskInfo::new("t1", "One", &[])]).await;
    let cp = fx.completed_task("t1", &[("a.txt", "a")]).await;

    let approved = fx
        .service
        .review_checkpoint(&cp.id, ReviewAction::Approve, Some("alice"), Some("lgtm"))
        .await
        .unwrap();
    assert_eq!(approved.review_status, ReviewStatus::Approved);
    assert_eq!(approved.reviewed_by.as_deref(), Some("alice"));
    assert!(approved.reviewed_at.is_some());

    let err = fx
        .service
        .review_checkpoint(&cp.id, ReviewAction::RequestChanges, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PromoteError::InvalidReviewTransition {
            from: ReviewStatus::Approved,
            to: ReviewStatus::ChangesRequested
        }
    ));

    let reset = fx
        .service
        .review_checkpoint(&cp.id, ReviewAction::Reset, None, None)
        .await
        .unwrap();
    assert_eq!(reset.review_status, ReviewStatus::Pending);
    assert!(reset.reviewed_by.is_none());

    let err = fx
        .service
        .review_checkpoint("missing", ReviewAction::Approve, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PromoteError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn test_promote_requires_execution_checkpoint_and_approval() {
    let fx = Fixture::new(vec![TaskInfo::new("t1", "One", &[])]).await;
    let err = fx.service.promote("t1", PromoteRequest::default()).await.unwrap_err();
    assert!(matches!(err, PromoteError::NoExecution { .. }));

    let cp = fx.completed_task("t1", &[("a.txt", "a")]).await;
    let err = fx.service.promote("t1", PromoteRequest::default()).await.unwrap_err();
    match err {
        PromoteError::RequiresApproval {
            checkpoint_id,
            review_status,
        } => {
            assert_eq!(checkpoint_id, cp.id);
            assert_eq!(review_status, ReviewStatus::Pending);
        }
        other => panic!("Expected RequiresApproval, got {other}"),
    }

    let forced = fx
        .service
        .promote(
            "t1",
            PromoteRequest {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.target_branch, "main");
}

#[tokio::test]
async fn test_promote_blocked_until_blocker_closed_or_promoted() {
    let fx = Fixture::new(vec![
        TaskInfo::new("base", "Base", &[]),
        TaskInfo::new("other", "Other", &[]),
        TaskInfo::new("top", "Top", &["base", "other"]),
    ])
    .await;
    let cp = fx.completed_task("top", &[("top.txt", "top")]).await;
    fx.approve(&cp).await;

    let err = fx.service.promote("top", PromoteRequest::default()).await.unwrap_err();
    match err {
        PromoteError::BlockedBy { blockers } => assert_eq!(blockers, vec!["base", "other"]),
        other => panic!("Expected BlockedBy, got {other}"),
    }

    // Force does not bypass blockers.
    let err = fx
        .service
        .promote(
            "top",
            PromoteRequest {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PromoteError::BlockedBy { .. }));

    let base_cp = fx.completed_task("base", &[("base.txt", "base")]).await;
    fx.approve(&base_cp).await;
    fx.service.promote("base", PromoteRequest::default()).await.unwrap();
    fx.tasks.close("other").await;

    fx.service.promote("top", PromoteRequest::default()).await.unwrap();
}

#[tokio::test]
async fn test_squash_lands_on_checked_out_target() {
    let fx = Fixture::new(vec![TaskInfo::new("t1", "One", &[])]).await;
    let cp = fx
        .completed_task("t1", &[("a.txt", "first\n"), ("b.txt", "second\n")])
        .await;
    fx.approve(&cp).await;
    let main_before = fx.repo.head().await;

    let promotion = fx.service.promote("t1", PromoteRequest::default()).await.unwrap();
    assert_eq!(promotion.strategy, MergeStrategy::Squash);
    assert_eq!(promotion.stats.files_changed, 2);
    assert_eq!(promotion.checkpoint_id, cp.id);

    // One new commit on main, and the main working copy follows it.
    let main_after = fx.repo.head().await;
    assert_eq!(main_after, promotion.merge_commit);
    let parent = git::rev_parse(fx.path(), "HEAD~1").await.unwrap();
    assert_eq!(parent, main_before);
    assert!(fx.path().join("a.txt").exists());
    assert!(fx.path().join("b.txt").exists());

    let promoted = fx.repo.db.call(|db| db.is_task_promoted("t1")).await.unwrap();
    assert!(promoted);
    let leftovers = fx.path().join(".foreman/promote").read_dir().unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_merge_into_branch_not_checked_out() {
    let fx = Fixture::new(vec![TaskInfo::new("t1", "One", &[])]).await;
    git::git(fx.path(), &["branch", "release"]).await.unwrap();
    let cp = fx.completed_task("t1", &[("feature.txt", "x\n")]).await;
    fx.approve(&cp).await;
    let main_before = fx.repo.head().await;

    let promotion = fx
        .service
        .promote(
            "t1",
            PromoteRequest {
                strategy: MergeStrategy::Merge,
                target_branch: Some("release".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(git::rev_parse(fx.path(), "release").await.unwrap(), promotion.merge_commit);
    let parents = git::git(fx.path(), &["rev-list", "--parents", "-n", "1", "release"])
        .await
        .unwrap();
    assert_eq!(parents.split_whitespace().count(), 3, "merge commit has two parents");
    assert_eq!(fx.repo.head().await, main_before);
    assert!(!fx.path().join("feature.txt").exists());
}

#[tokio::test]
async fn test_conflicting_promotion_leaves_target_untouched() {
    let fx = Fixture::new(vec![TaskInfo::new("t1", "One", &[])]).await;
    let cp = fx.completed_task("t1", &[("README.md", "# from task\n")]).await;
    fx.approve(&cp).await;
    commit_file(fx.path(), "README.md", "# from main\n").await;
    let main_before = fx.repo.head().await;

    let err = fx.service.promote("t1", PromoteRequest::default()).await.unwrap_err();
    match &err {
        PromoteError::Conflicts { files, .. } => assert!(files.contains(&"README.md".to_string())),
        other => panic!("Expected Conflicts, got {other}"),
    }
    assert!(err.remediation().contains("resolve"));
    assert_eq!(fx.repo.head().await, main_before);
    let readme = std::fs::read_to_string(fx.path().join("README.md")).unwrap();
    assert_eq!(readme, "# from main\n");
    assert!(!fx.repo.db.call(|db| db.is_task_promoted("t1")).await.unwrap());
}
