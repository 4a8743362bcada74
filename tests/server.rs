mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use dqt::error::DqtError;
use dqt::server::{router, status_of};

#[test]
fn errors_map_to_statuses() {
    let cases = [
        (DqtError::SaveConflict { name: "q".into() }, StatusCode::CONFLICT),
        (DqtError::Superseded { generation: 3 }, StatusCode::CONFLICT),
        (DqtError::parse("bad"), StatusCode::BAD_REQUEST),
        (DqtError::NotSelected { instrument: "A".into(), field: "f".into() }, StatusCode::BAD_REQUEST),
        (DqtError::InvalidPath("/9".into()), StatusCode::BAD_REQUEST),
        (DqtError::NotFound("q".into()), StatusCode::NOT_FOUND),
        (DqtError::Persistence("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (error, status) in cases {
        assert_eq!(status_of(&error), status, "{}", error);
    }
}

#[tokio::test]
async fn router_builds_over_a_workspace() {
    let query = Arc::new(common::interface().await);
    let _router = router(Arc::clone(&query));
    assert_eq!(query.setup().visits, vec!["V1", "V2", "V3"]);
}
