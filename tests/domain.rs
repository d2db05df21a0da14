use assert_matches::assert_matches;

use smrtlink_share::domain::{
    DatasetUuid, Job, JobId, JobPhase, JobState, MemberId, ProjectId, ProjectPayload,
    ProjectSnapshot,
};
use smrtlink_share::error::ShareError;

#[test]
fn parse_project_id() {
    let id: ProjectId = "42".parse().unwrap();
    assert_eq!(id.get(), 42);
    assert_matches!("0".parse::<ProjectId>(), Err(ShareError::InvalidProjectId(_)));
    assert_matches!("abc".parse::<ProjectId>(), Err(ShareError::InvalidProjectId(_)));
}

#[test]
fn parse_dataset_uuid_invalid() {
    let err = "not-a-uuid".parse::<DatasetUuid>().unwrap_err();
    assert_matches!(err, ShareError::InvalidDatasetUuid(_));
}

#[test]
fn project_payload_to_snapshot() {
    let payload: ProjectPayload = serde_json::from_str(
        r#"{
            "id": 5,
            "name": "Arabidopsis resequencing",
            "datasets": [
                {
                    "uuid": "6A4B1E2C-0F3D-4E5A-9B8C-7D6E5F4A3B2C",
                    "name": "Leaf",
                    "path": "/data/r1/leaf.consensusreadset.xml",
                    "numChildren": 0,
                    "parentUuid": "7b4b1e2c-0f3d-4e5a-9b8c-7d6e5f4a3b2c",
                    "createdAt": "2024-05-01T10:00:00Z"
                },
                {
                    "uuid": "8c4b1e2c-0f3d-4e5a-9b8c-7d6e5f4a3b2c",
                    "name": "Demultiplexed",
                    "path": "/data/r1/parent.consensusreadset.xml",
                    "numChildren": 3
                }
            ],
            "members": [
                {"login": "alice", "role": "OWNER"},
                {"login": "bob", "role": "CAN_EDIT"},
                {"login": "carol", "role": "CAN_VIEW"},
                {"login": "bob", "role": "CAN_VIEW"}
            ]
        }"#,
    )
    .unwrap();

    let snapshot = ProjectSnapshot::from(payload);
    assert_eq!(snapshot.dir_name(), "Project 5: Arabidopsis resequencing");
    assert_eq!(snapshot.members, vec![MemberId::new("bob"), MemberId::new("carol")]);
    assert_eq!(snapshot.datasets.len(), 2);
    assert_eq!(
        snapshot.datasets[0].uuid.as_str(),
        "6a4b1e2c-0f3d-4e5a-9b8c-7d6e5f4a3b2c"
    );
    assert!(snapshot.datasets[0].parent_uuid.is_some());
    assert_eq!(snapshot.datasets[1].num_children, 3);
    assert!(snapshot.datasets[1].parent_uuid.is_none());
}

#[test]
fn job_states_map_to_phases() {
    let job: Job = serde_json::from_str(
        r#"{"id": 17, "name": "Mapping", "state": "RUNNING", "createdAt": "2024-05-01T10:00:00.123Z", "jobTypeId": "pbsmrtpipe"}"#,
    )
    .unwrap();
    assert_eq!(job.id, JobId::new(17));
    assert_eq!(job.state.phase(), JobPhase::Pending);
    assert_eq!(JobState::Successful.phase(), JobPhase::Succeeded);
    for state in [JobState::Failed, JobState::Terminated, JobState::Aborted] {
        assert_eq!(state.phase(), JobPhase::Failed);
    }
    assert!(serde_json::from_str::<JobState>(r#""PAUSED""#).is_err());
}
