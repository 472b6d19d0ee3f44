use super::*;

#[test]
fn id_shape_is_tool_action_target() {
    let id = compute_approval_id("bash", "execute", "ls -la").unwrap();
    assert_eq!(id, "bash:execute:ls -la");
}

#[test]
fn empty_target_is_hard_error() {
    assert!(compute_approval_id("bash", "execute", "").is_err());
    assert!(compute_approval_id("bash", "execute", "   ").is_err());
}

#[test]
fn string_targets_lowercased_and_trimmed() {
    let a = compute_approval_id("bash", "execute", "  Ls -LA  ").unwrap();
    let b = compute_approval_id("bash", "execute", "ls -la").unwrap();
    assert_eq!(a, b);
}

#[test]
fn url_query_order_does_not_matter() {
    let a = compute_approval_id("web_fetch", "get", "https://api.example.com/x?a=1&b=2").unwrap();
    let b = compute_approval_id("web_fetch", "get", "https://api.example.com/x?b=2&a=1").unwrap();
    assert_eq!(a, b);
}

#[test]
fn url_query_values_do_matter() {
    let a = compute_approval_id("web_fetch", "get", "https://api.example.com/x?id=1").unwrap();
    let b = compute_approval_id("web_fetch", "get", "https://api.example.com/x?id=2").unwrap();
    assert_ne!(a, b);
}

#[test]
fn url_fragment_never_affects_id() {
    let a = compute_approval_id("web_fetch", "get", "https://example.com/page#top").unwrap();
    let b = compute_approval_id("web_fetch", "get", "https://example.com/page#bottom").unwrap();
    let c = compute_approval_id("web_fetch", "get", "https://example.com/page").unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
}

#[test]
fn url_host_case_insensitive() {
    let a = compute_approval_id("web_fetch", "get", "https://EXAMPLE.com/Path").unwrap();
    let b = compute_approval_id("web_fetch", "get", "https://example.com/Path").unwrap();
    assert_eq!(a, b);
    // Path case is preserved
    let c = compute_approval_id("web_fetch", "get", "https://example.com/path").unwrap();
    assert_ne!(a, c);
}

#[test]
fn url_trailing_slash_stripped_root_preserved() {
    let a = compute_approval_id("web_fetch", "get", "https://example.com/dir/").unwrap();
    let b = compute_approval_id("web_fetch", "get", "https://example.com/dir").unwrap();
    assert_eq!(a, b);

    let root = compute_approval_id("web_fetch", "get", "https://example.com").unwrap();
    assert!(root.ends_with("example.com/"));
    let root_slash = compute_approval_id("web_fetch", "get", "https://example.com/").unwrap();
    assert_eq!(root, root_slash);
}

#[test]
fn long_targets_truncate_with_distinct_hash_suffix() {
    let base = "x".repeat(MAX_TARGET_CHARS);
    let a = compute_approval_id("bash", "execute", &format!("{}AAAA", base)).unwrap();
    let b = compute_approval_id("bash", "execute", &format!("{}BBBB", base)).unwrap();
    // Same visible prefix, different ids
    assert_ne!(a, b);
    assert_eq!(a.len(), b.len());
    // 200-char prefix + '#' + 8-hex suffix
    let target_part = a.splitn(3, ':').nth(2).unwrap();
    assert_eq!(target_part.chars().count(), MAX_TARGET_CHARS + 9);
}

#[test]
fn short_targets_not_hashed() {
    let id = compute_approval_id("bash", "execute", &"y".repeat(MAX_TARGET_CHARS)).unwrap();
    assert!(!id.contains('#'));
}

#[test]
fn non_http_schemes_normalize_as_strings() {
    let id = compute_approval_id("bash", "execute", "mailto:Bob@Example.com").unwrap();
    assert_eq!(id, "bash:execute:mailto:bob@example.com");
}

fn scripted_prompt(
    decisions: Vec<Option<ApprovalDecision>>,
) -> (ApprovalPrompt, std::sync::Arc<StdMutex<Vec<ApprovalRequest>>>) {
    let seen = std::sync::Arc::new(StdMutex::new(Vec::new()));
    let queue = std::sync::Arc::new(StdMutex::new(decisions));
    let seen_cb = seen.clone();
    let prompt: ApprovalPrompt = Box::new(move |req| {
        seen_cb.lock().unwrap().push(req);
        let next = {
            let mut q = queue.lock().unwrap();
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        };
        Box::pin(async move { next.flatten() })
    });
    (prompt, seen)
}

fn request(id: &str) -> ApprovalRequest {
    ApprovalRequest {
        approval_id: id.to_string(),
        tool: "bash".to_string(),
        action: "execute".to_string(),
        target: "ls".to_string(),
        is_dangerous: false,
    }
}

#[tokio::test]
async fn denied_without_prompt_surface() {
    let manager = ApprovalManager::new(Duration::from_secs(1));
    let mut session = HashSet::new();
    let outcome = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert!(matches!(outcome, ApprovalOutcome::Denied(_)));
}

#[tokio::test]
async fn once_scope_prompts_every_time() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let (prompt, seen) = scripted_prompt(vec![
        Some(ApprovalDecision {
            approved: true,
            remember: ApprovalScope::Once,
        }),
        Some(ApprovalDecision {
            approved: true,
            remember: ApprovalScope::Once,
        }),
    ]);
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    let first = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(first, ApprovalOutcome::Granted(ApprovalScope::Once));
    let second = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(second, ApprovalOutcome::Granted(ApprovalScope::Once));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn session_scope_skips_repeat_prompts() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let (prompt, seen) = scripted_prompt(vec![Some(ApprovalDecision {
        approved: true,
        remember: ApprovalScope::Session,
    })]);
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    let first = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(first, ApprovalOutcome::Granted(ApprovalScope::Session));
    assert!(session.contains("bash:execute:ls"));

    let second = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(second, ApprovalOutcome::AlreadyGranted);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn session_grants_do_not_cover_other_targets() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let (prompt, _) = scripted_prompt(vec![
        Some(ApprovalDecision {
            approved: true,
            remember: ApprovalScope::Session,
        }),
        None,
    ]);
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    manager.resolve(request("bash:execute:ls"), &mut session).await;
    // A different normalized target is a different id — prompt again (queue
    // yields None → denial)
    let other = manager.resolve(request("bash:execute:rm -rf"), &mut session).await;
    assert!(matches!(other, ApprovalOutcome::Denied(_)));
}

#[tokio::test]
async fn wildcard_grant_covers_tool() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let mut session = HashSet::new();
    session.insert(wildcard_approval_id("bash"));
    let outcome = manager.resolve(request("bash:execute:anything"), &mut session).await;
    assert_eq!(outcome, ApprovalOutcome::AlreadyGranted);
}

#[tokio::test]
async fn denial_is_not_remembered() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let (prompt, seen) = scripted_prompt(vec![
        Some(ApprovalDecision {
            approved: false,
            remember: ApprovalScope::Session,
        }),
        Some(ApprovalDecision {
            approved: true,
            remember: ApprovalScope::Once,
        }),
    ]);
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    let first = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(first, ApprovalOutcome::Denied("denied".to_string()));
    assert!(session.is_empty());

    let second = manager.resolve(request("bash:execute:ls"), &mut session).await;
    assert!(second.is_granted());
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn timeout_is_denial() {
    let manager = ApprovalManager::new(Duration::from_millis(50));
    let prompt: ApprovalPrompt = Box::new(|_req| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Some(ApprovalDecision {
                approved: true,
                remember: ApprovalScope::Once,
            })
        })
    });
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    let outcome = manager.resolve(request("bash:execute:ls"), &mut session).await;
    match outcome {
        ApprovalOutcome::Denied(reason) => assert!(reason.contains("timed out")),
        other => panic!("expected denial, got {:?}", other),
    }
}

#[tokio::test]
async fn always_scope_persists_across_managers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("approvals.json");

    let manager = ApprovalManager::with_persistence(Duration::from_secs(5), path.clone()).unwrap();
    let (prompt, _) = scripted_prompt(vec![Some(ApprovalDecision {
        approved: true,
        remember: ApprovalScope::Always,
    })]);
    manager.set_prompt(prompt).await;
    let mut session = HashSet::new();
    manager.resolve(request("bash:execute:ls"), &mut session).await;

    // A fresh manager loads the grant from disk; no prompt registered, yet
    // the id resolves without one.
    let reloaded = ApprovalManager::with_persistence(Duration::from_secs(5), path).unwrap();
    let mut session = HashSet::new();
    let outcome = reloaded.resolve(request("bash:execute:ls"), &mut session).await;
    assert_eq!(outcome, ApprovalOutcome::AlreadyGranted);
}

#[tokio::test]
async fn dangerous_flag_reaches_prompt() {
    let manager = ApprovalManager::new(Duration::from_secs(5));
    let (prompt, seen) = scripted_prompt(vec![Some(ApprovalDecision {
        approved: false,
        remember: ApprovalScope::Once,
    })]);
    manager.set_prompt(prompt).await;

    let mut session = HashSet::new();
    let mut req = request("bash:execute:rm -rf /");
    req.is_dangerous = true;
    manager.resolve(req, &mut session).await;
    assert!(seen.lock().unwrap()[0].is_dangerous);
}
