// [[file:../fleet.note::71e0a9c4][71e0a9c4]]
use std::collections::BTreeMap;
use std::net::TcpListener;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use gosh_fleet::base::Backoff;
use gosh_fleet::compute::{wait_operation, ComputeApi, GceApi, InstanceRequest};
// 71e0a9c4 ends here

// [[file:../fleet.note::be3f6d58][be3f6d58]]
type Reply = (StatusCode, Json<Value>);

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer token-hoge")
}

fn not_found(what: &str) -> Reply {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"code": 404, "message": format!("The resource '{what}' was not found")}})),
    )
}

async fn list_instances(headers: HeaderMap, Query(query): Query<BTreeMap<String, String>>) -> Reply {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": {"message": "no token"}})));
    }
    assert!(query["filter"].contains("ab-hm"));
    let page = match query.get("pageToken").map(|s| s.as_str()) {
        None => json!({
            "items": [{"name": "ab-hm", "status": "RUNNING",
                       "networkInterfaces": [{"networkIP": "10.0.0.2",
                                              "accessConfigs": [{"natIP": "203.0.113.2"}]}]}],
            "nextPageToken": "page-2",
        }),
        Some("page-2") => json!({"items": [{"name": "ab-hw-000", "status": "PROVISIONING"}]}),
        Some(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "bad page"}}))),
    };
    (StatusCode::OK, Json(page))
}

async fn insert_instance(State(base): State<String>, Json(body): Json<Value>) -> Reply {
    assert_eq!(body["name"], "ab-hm");
    assert_eq!(body["canIpForward"], true);
    let op = json!({
        "name": "operation-1",
        "status": "RUNNING",
        "selfLink": format!("{base}/projects/p/zones/z/operations/operation-1"),
    });
    (StatusCode::OK, Json(op))
}

async fn get_operation(Path(name): Path<String>) -> Reply {
    let op = json!({
        "name": name,
        "status": "DONE",
        "warnings": [{"code": "DISK_SIZE_LARGER_THAN_IMAGE_SIZE", "message": "disk is larger than image"}],
    });
    (StatusCode::OK, Json(op))
}

async fn instance(Path(name): Path<String>) -> Reply {
    if name == "ab-hm" {
        (StatusCode::OK, Json(json!({"name": "ab-hm", "status": "RUNNING"})))
    } else {
        not_found(&name)
    }
}

async fn route(Path(name): Path<String>) -> Reply {
    not_found(&name)
}

async fn serve() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/projects/p/zones/z/instances", get(list_instances).post(insert_instance))
        .route("/projects/p/zones/z/instances/:name", get(instance).delete(instance))
        .route("/projects/p/zones/z/operations/:name", get(get_operation))
        .route("/projects/p/global/routes/:name", get(route).delete(route))
        .with_state(base.clone());
    let server = axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service());
    tokio::spawn(server);
    base
}
// be3f6d58 ends here

// [[file:../fleet.note::0a5c8e19][0a5c8e19]]
#[tokio::test]
async fn test_gce_api() {
    let base = serve().await;
    let api = GceApi::connect(&base, "p", "z", "token-hoge").unwrap();

    // pages are followed
    let instances = api.list_instances(r#"name eq "^(ab-hm|ab-hw-\d+)$""#).await.unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].internal_ip(), Some("10.0.0.2"));
    assert_eq!(instances[0].external_ip(), Some("203.0.113.2"));
    assert!(!instances[1].is_running());

    assert!(api.get_instance("ab-hm").await.unwrap().is_some());
    assert!(api.get_instance("ab-hw-009").await.unwrap().is_none());

    // missing resources are reported as not found with the server message
    let e = api.delete_instance("ab-hw-009").await.unwrap_err();
    assert!(e.is_not_found());
    assert!(e.message.contains("ab-hw-009"));
    assert!(api.delete_route("ab-hm-nat").await.unwrap_err().is_not_found());

    // operations are polled through their link
    let request = InstanceRequest {
        name: "ab-hm".into(),
        machine_type: "n1-highcpu-4".into(),
        image: "image".into(),
        metadata: BTreeMap::new(),
        external_ip: true,
        can_ip_forward: true,
        tags: vec![],
        scopes: vec![],
    };
    let op = api.create_instance(&request).await.unwrap();
    assert!(!op.is_done());
    let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(5));
    let op = wait_operation(&api, op, &backoff, &CancellationToken::new()).await.unwrap();
    assert!(op.is_done());
    assert_eq!(op.warnings.len(), 1);
}

#[tokio::test]
async fn test_gce_api_unauthorized() {
    let base = serve().await;
    let api = GceApi::connect(&base, "p", "z", "wrong").unwrap();
    let e = api.list_instances("name eq ab-hm").await.unwrap_err();
    assert_eq!(e.status, Some(401));
    assert_eq!(e.message, "no token");
}
// 0a5c8e19 ends here
