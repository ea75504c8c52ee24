//! Integration tests for the project coordinator: broadcasting
//! close/commit/delete across multiple computes without letting one
//! failure abort the rest, and idempotent compute registration.

use netemctl_core::{ComputeClient, Project};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// With three registered computes, a failure on the second does not stop
/// the third from receiving its broadcast call.
#[tokio::test]
async fn close_broadcasts_to_every_compute_even_after_a_failure() {
    let server_1 = MockServer::start().await;
    let server_2 = MockServer::start().await;
    let server_3 = MockServer::start().await;

    let project = Project::new(None, None, None, false);
    let pid = project.id();

    for server in [&server_1, &server_2, &server_3] {
        Mock::given(method("POST"))
            .and(path("/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path(format!("/projects/{pid}/close")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server_1)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/projects/{pid}/close")))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server_2)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/projects/{pid}/close")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server_3)
        .await;

    project
        .add_compute(ComputeClient::new("c1", server_1.uri()))
        .await
        .unwrap();
    project
        .add_compute(ComputeClient::new("c2", server_2.uri()))
        .await
        .unwrap();
    project
        .add_compute(ComputeClient::new("c3", server_3.uri()))
        .await
        .unwrap();

    let result = project.close().await;

    assert_eq!(result.succeeded.len(), 2);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, "c2");

    let requests_3 = server_3.received_requests().await.unwrap();
    assert!(
        requests_3
            .iter()
            .any(|r| r.method.as_str() == "POST" && r.url.path().ends_with("/close")),
        "compute 3 must still receive its close call after compute 2 failed"
    );
}

/// `add_compute` re-registering the same compute id is a no-op: it must
/// not re-issue the `POST /projects` registration call.
#[tokio::test]
async fn add_compute_is_idempotent_on_reregistration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let project = Project::new(None, None, None, false);
    let compute = ComputeClient::new("c1", server.uri());
    project.add_compute(compute.clone()).await.unwrap();
    project.add_compute(compute).await.unwrap();

    server.verify().await;
}
