//! Connect: transport negotiation, import and poll state

mod common;

use common::{Harness, USER_ID, numbered_items, rss_feed};
use fedinbox::data::{
    Rule, RuleBehavior, RuleType, SubscriptionMethod, SubscriptionStatus, SubscriptionStore,
    unix_now,
};
use fedinbox::service::PollPolicy;
use serde_json::json;

const BLOG: &str = "https://blog.example";

fn serve_blog(harness: &Harness, count: usize) {
    harness.remote.serve(
        &format!("{}/feed.xml", BLOG),
        "application/rss+xml",
        rss_feed(BLOG, None, &numbered_items(BLOG, count)),
    );
}

fn serve_actor(harness: &Harness) {
    harness.remote.serve_json(
        "https://remote.example/users/bob",
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/users/bob",
            "type": "Person",
            "name": "Bob",
            "url": "https://remote.example/@bob",
            "inbox": "https://remote.example/users/bob/inbox",
            "outbox": "https://remote.example/users/bob/outbox",
        }),
    );
    harness.remote.serve_json(
        "https://remote.example/users/bob/outbox",
        json!({
            "id": "https://remote.example/users/bob/outbox",
            "type": "OrderedCollection",
            "orderedItems": [
                {
                    "id": "https://remote.example/activities/2",
                    "type": "Create",
                    "object": {
                        "id": "https://remote.example/notes/2",
                        "type": "Note",
                        "attributedTo": "https://remote.example/users/bob",
                        "content": "<p>second</p>",
                        "published": "2024-05-02T12:00:00Z",
                    },
                },
                {
                    "id": "https://remote.example/activities/1",
                    "type": "Create",
                    "object": {
                        "id": "https://remote.example/notes/1",
                        "type": "Note",
                        "attributedTo": "https://remote.example/users/bob",
                        "content": "<p>first</p>",
                        "published": "2024-05-01T12:00:00Z",
                    },
                },
            ],
        }),
    );
}

#[tokio::test]
async fn test_rss_bootstrap_marks_oldest_items_read() {
    let harness = Harness::new().await;
    serve_blog(&harness, 10);
    let mut subscription = harness.subscription(&format!("{}/feed.xml", BLOG)).await;

    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 10);
    assert!(report.errors.is_empty());

    let messages = harness.db.get_messages(USER_ID).await.unwrap();
    assert_eq!(messages.len(), 10);
    for message in &messages {
        let n: usize = message.url.rsplit('/').next().unwrap().parse().unwrap();
        assert_eq!(
            message.is_read(),
            n <= 6,
            "post {} read state should follow bootstrap rule",
            n
        );
    }

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.method, SubscriptionMethod::Rss);
    assert_eq!(stored.status, SubscriptionStatus::Success);
    assert_eq!(stored.profile_url, BLOG);
    assert_eq!(stored.label, "Example Blog");
    assert_eq!(stored.poll_duration, 24);
    assert!(stored.last_polled > 0);
    assert_eq!(stored.next_poll, stored.last_polled + 24 * 3600);
}

#[tokio::test]
async fn test_second_poll_stops_at_known_entry() {
    let harness = Harness::new().await;
    serve_blog(&harness, 10);
    let mut subscription = harness.subscription(&format!("{}/feed.xml", BLOG)).await;
    harness.service.connect(&mut subscription).await.unwrap();

    serve_blog(&harness, 12);
    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.merged, 0);

    let messages = harness.db.get_messages(USER_ID).await.unwrap();
    assert_eq!(messages.len(), 12);
    let newest: Vec<_> = messages
        .iter()
        .filter(|m| m.url.ends_with("/posts/11") || m.url.ends_with("/posts/12"))
        .collect();
    assert_eq!(newest.len(), 2);
    assert!(newest.iter().all(|m| !m.is_read()));
}

#[tokio::test]
async fn test_activitypub_wins_over_websub() {
    let harness = Harness::new().await;
    serve_actor(&harness);
    harness
        .remote
        .advertise_hub("https://remote.example/users/bob", "https://hub.example/");
    let mut subscription = harness.subscription("https://remote.example/users/bob").await;

    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 2);

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.method, SubscriptionMethod::ActivityPub);
    assert_eq!(stored.profile_url, "https://remote.example/users/bob");
    assert_eq!(stored.label, "Bob");
    assert_eq!(
        stored.activitypub_inbox.as_deref(),
        Some("https://remote.example/users/bob/inbox")
    );
    assert!(stored.follow_activity_id.is_some());
    assert!(stored.websub_hub.is_none());
    assert_eq!(stored.poll_duration, 720);

    assert_eq!(harness.sender.activity_types(), vec!["Follow".to_string()]);
    assert!(harness.hub.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_websub_hub_is_used_for_feeds() {
    let harness = Harness::new().await;
    let url = format!("{}/feed.xml", BLOG);
    serve_blog(&harness, 3);
    harness.remote.advertise_hub(&url, "https://hub.example/");
    let mut subscription = harness.subscription(&url).await;

    harness.service.connect(&mut subscription).await.unwrap();

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.method, SubscriptionMethod::WebSub);
    assert_eq!(stored.websub_hub.as_deref(), Some("https://hub.example/"));
    assert_eq!(stored.websub_topic.as_deref(), Some(url.as_str()));
    assert!(stored.websub_secret.is_some());
    assert_eq!(stored.poll_duration, 168);

    let requests = harness.hub.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].1.callback,
        format!("https://inbox.example/websub/{}", subscription.id)
    );
}

#[tokio::test]
async fn test_unreachable_target_fails_with_backoff() {
    let harness = Harness::new().await;
    let mut subscription = harness.subscription("https://gone.example/feed").await;
    let policy = PollPolicy::default();

    let before = unix_now();
    harness.service.connect(&mut subscription).await.unwrap();
    let first = harness.reload(&subscription).await;
    assert_eq!(first.status, SubscriptionStatus::Failure);
    assert_eq!(first.error_count, 1);
    assert_eq!(first.last_polled, 0);
    assert!(first.next_poll >= before + policy.backoff_seconds(1));
    assert!(first.status_message.contains("404"));

    harness.service.connect(&mut subscription).await.unwrap();
    let second = harness.reload(&subscription).await;
    assert_eq!(second.error_count, 2);
    assert!(second.next_poll >= first.next_poll);

    // A later success resets the error count
    harness.remote.serve(
        "https://gone.example/feed",
        "application/rss+xml",
        rss_feed(BLOG, None, &numbered_items(BLOG, 1)),
    );
    harness.service.connect(&mut subscription).await.unwrap();
    let recovered = harness.reload(&subscription).await;
    assert_eq!(recovered.status, SubscriptionStatus::Success);
    assert_eq!(recovered.error_count, 0);
    assert!(recovered.next_poll >= second.next_poll);
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_bad_urls() {
    let harness = Harness::new().await;
    serve_blog(&harness, 1);
    let url = format!("{}/feed.xml", BLOG);

    let created = harness
        .service
        .create_subscription(USER_ID, "inbox", &url)
        .await
        .unwrap();
    assert_eq!(created.status, SubscriptionStatus::New);

    let duplicate = harness
        .service
        .create_subscription(USER_ID, "inbox", &url)
        .await;
    assert!(matches!(
        duplicate,
        Err(fedinbox::error::AppError::Validation(_))
    ));

    let bad = harness
        .service
        .create_subscription(USER_ID, "inbox", "ftp://blog.example/feed")
        .await;
    assert!(matches!(bad, Err(fedinbox::error::AppError::Validation(_))));

    let no_folder = harness
        .service
        .create_subscription(USER_ID, " ", "https://other.example/feed")
        .await;
    assert!(matches!(
        no_folder,
        Err(fedinbox::error::AppError::Validation(_))
    ));
}

fn post_number(url: &str) -> usize {
    url.rsplit('/').next().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_import_is_capped_at_newest_entries() {
    let harness = Harness::new().await;
    serve_blog(&harness, 300);
    let mut subscription = harness.subscription(&format!("{}/feed.xml", BLOG)).await;

    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 256);

    let messages = harness.db.get_messages(USER_ID).await.unwrap();
    assert_eq!(messages.len(), 256);
    let oldest = messages.iter().map(|m| post_number(&m.url)).min().unwrap();
    assert_eq!(oldest, 300 - 256 + 1);
    let read: Vec<_> = messages
        .iter()
        .filter(|m| m.is_read())
        .map(|m| post_number(&m.url))
        .collect();
    assert_eq!(read.len(), 6);
    assert!(read.iter().all(|n| *n <= oldest + 5));
}

#[tokio::test]
async fn test_broken_outbox_entry_does_not_abort_import() {
    let harness = Harness::new().await;
    serve_actor(&harness);
    harness.remote.serve_json(
        "https://remote.example/users/bob/outbox",
        json!({
            "id": "https://remote.example/users/bob/outbox",
            "type": "OrderedCollection",
            "orderedItems": [
                {
                    "id": "https://remote.example/activities/3",
                    "type": "Create",
                    "object": {
                        "id": "https://remote.example/notes/3",
                        "type": "Note",
                        "content": "<p>third</p>",
                        "published": "2024-05-03T12:00:00Z",
                    },
                },
                "https://remote.example/notes/missing",
                {
                    "id": "https://remote.example/activities/1",
                    "type": "Create",
                    "object": {
                        "id": "https://remote.example/notes/1",
                        "type": "Note",
                        "content": "<p>first</p>",
                        "published": "2024-05-01T12:00:00Z",
                    },
                },
            ],
        }),
    );
    let mut subscription = harness.subscription("https://remote.example/users/bob").await;

    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("notes/missing"));

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.status, SubscriptionStatus::Success);
    assert_eq!(stored.error_count, 0);
    assert!(stored.status_message.contains("1 item(s) could not be imported"));
}

#[tokio::test]
async fn test_failed_follow_falls_back_to_websub() {
    let harness = Harness::new().await;
    serve_actor(&harness);
    harness
        .remote
        .advertise_hub("https://remote.example/users/bob", "https://hub.example/");
    harness.sender.fail_deliveries();
    let mut subscription = harness.subscription("https://remote.example/users/bob").await;

    harness.service.connect(&mut subscription).await.unwrap();

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.status, SubscriptionStatus::Success);
    assert_eq!(stored.method, SubscriptionMethod::WebSub);
    assert_eq!(stored.websub_hub.as_deref(), Some("https://hub.example/"));
    assert!(stored.activitypub_inbox.is_none());
    assert!(stored.follow_activity_id.is_none());
    assert_eq!(stored.poll_duration, 168);
    assert!(harness.sender.activity_types().is_empty());
    assert_eq!(harness.hub.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_follow_without_hub_falls_back_to_rss() {
    let harness = Harness::new().await;
    serve_actor(&harness);
    harness.sender.fail_deliveries();
    let mut subscription = harness.subscription("https://remote.example/users/bob").await;

    harness.service.connect(&mut subscription).await.unwrap();

    let stored = harness.reload(&subscription).await;
    assert_eq!(stored.status, SubscriptionStatus::Success);
    assert_eq!(stored.method, SubscriptionMethod::Rss);
    assert!(stored.follow_activity_id.is_none());
    assert_eq!(stored.poll_duration, 24);
}

#[tokio::test]
async fn test_purged_entries_are_not_reimported() {
    let harness = Harness::new().await;
    let url = format!("{}/feed.xml", BLOG);
    serve_blog(&harness, 3);
    let mut subscription = harness.subscription(&url).await;
    subscription.purge_duration = 1;
    harness
        .db
        .save_subscription(&subscription, "test")
        .await
        .unwrap();

    harness.service.connect(&mut subscription).await.unwrap();
    let purged = harness
        .purger
        .purge_inbox(&subscription, unix_now() + 2 * 86_400)
        .await
        .unwrap();
    assert_eq!(purged, 3);

    // Unchanged feed: everything is already seen
    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 0);
    assert!(harness.db.get_messages(USER_ID).await.unwrap().is_empty());

    // Only entries published after the purge come in
    serve_blog(&harness, 5);
    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.inserted, 2);
    let mut urls: Vec<_> = harness
        .db
        .get_messages(USER_ID)
        .await
        .unwrap()
        .into_iter()
        .map(|m| post_number(&m.url))
        .collect();
    urls.sort();
    assert_eq!(urls, vec![4, 5]);
}

#[tokio::test]
async fn test_bootstrap_read_count_skips_blocked_entries() {
    let harness = Harness::new().await;
    harness
        .service
        .rules()
        .save_rule(Rule::new(
            USER_ID,
            RuleType::Content,
            "sponsored",
            RuleBehavior::Block,
        ))
        .await
        .unwrap();

    let mut items = numbered_items(BLOG, 10);
    for item in items.iter_mut() {
        if post_number(&item.0) <= 2 {
            item.1 = "Sponsored".to_string();
        }
    }
    let url = format!("{}/feed.xml", BLOG);
    harness
        .remote
        .serve(&url, "application/rss+xml", rss_feed(BLOG, None, &items));
    let mut subscription = harness.subscription(&url).await;

    let report = harness.service.connect(&mut subscription).await.unwrap();
    assert_eq!(report.blocked, 2);
    assert_eq!(report.inserted, 8);

    let messages = harness.db.get_messages(USER_ID).await.unwrap();
    for message in &messages {
        let n = post_number(&message.url);
        assert_eq!(message.is_read(), n <= 8, "post {} read state", n);
    }
    assert_eq!(messages.iter().filter(|m| m.is_read()).count(), 6);
}
