use audioshield::identity::AccountId;
use audioshield::otp::{OtpChallenge, OtpValidation};
use audioshield::store::{JsonFileStore, OtpStore, VoicePrintStore, delete_account_records};
use audioshield::voiceprint::{EmbeddingVector, VoicePrint};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(600);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn challenge(dir: &tempfile::TempDir) -> OtpChallenge {
    OtpChallenge::new(Arc::new(JsonFileStore::new(dir.path())), TTL)
}

#[tokio::test]
async fn issued_code_survives_reopening_store() {
    let dir = tempfile::tempdir().unwrap();
    let account = AccountId::new("uid-1");

    let issued = challenge(&dir).issue(&account, t0()).await.unwrap();

    let reopened = challenge(&dir);
    let result = reopened
        .validate(&account, issued.code.as_str(), t0() + chrono::Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(result, OtpValidation::Ok);
}

#[tokio::test]
async fn reissue_supersedes_previous_code() {
    let dir = tempfile::tempdir().unwrap();
    let otp = challenge(&dir);
    let account = AccountId::new("uid-1");

    let first = otp.issue(&account, t0()).await.unwrap();
    let second = otp.issue(&account, t0()).await.unwrap();

    if first.code != second.code {
        assert_eq!(
            otp.validate(&account, first.code.as_str(), t0()).await.unwrap(),
            OtpValidation::Mismatch
        );
    }
    assert_eq!(
        otp.validate(&account, second.code.as_str(), t0()).await.unwrap(),
        OtpValidation::Ok
    );
}

#[tokio::test]
async fn consumed_code_cannot_be_reused() {
    let dir = tempfile::tempdir().unwrap();
    let otp = challenge(&dir);
    let account = AccountId::new("uid-1");
    let issued = otp.issue(&account, t0()).await.unwrap();

    assert_eq!(
        otp.validate(&account, issued.code.as_str(), t0()).await.unwrap(),
        OtpValidation::Ok
    );
    assert_eq!(
        otp.validate(&account, issued.code.as_str(), t0()).await.unwrap(),
        OtpValidation::NotFound
    );

    let store = JsonFileStore::new(dir.path());
    let record = store.otp(&account).await.unwrap().unwrap();
    assert!(record.consumed);
}

#[tokio::test]
async fn expiry_is_inclusive_of_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let otp = challenge(&dir);
    let account = AccountId::new("uid-1");
    let ttl = chrono::Duration::from_std(TTL).unwrap();

    let issued = otp.issue(&account, t0()).await.unwrap();
    assert_eq!(
        otp.validate(&account, issued.code.as_str(), t0() + ttl + chrono::Duration::seconds(1))
            .await
            .unwrap(),
        OtpValidation::Expired
    );

    let issued = otp.issue(&account, t0()).await.unwrap();
    assert_eq!(
        otp.validate(&account, issued.code.as_str(), t0() + ttl).await.unwrap(),
        OtpValidation::Ok
    );
}

#[tokio::test]
async fn codes_are_kept_per_account() {
    let dir = tempfile::tempdir().unwrap();
    let otp = challenge(&dir);
    let ana = AccountId::new("uid-ana");
    let ben = AccountId::new("uid-ben");

    let issued = otp.issue(&ana, t0()).await.unwrap();

    assert_eq!(
        otp.validate(&ben, issued.code.as_str(), t0()).await.unwrap(),
        OtpValidation::NotFound
    );
    assert_eq!(
        otp.validate(&ana, issued.code.as_str(), t0()).await.unwrap(),
        OtpValidation::Ok
    );
}

#[tokio::test]
async fn voiceprint_round_trips_and_is_deleted_with_account() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());
    let account = AccountId::new("uid-1");
    let voiceprint = VoicePrint::new(
        account.clone(),
        EmbeddingVector::new(vec![0.5, -0.25, 0.125]),
        t0(),
    );

    store.persist_voiceprint(&voiceprint).await.unwrap();
    OtpChallenge::new(Arc::new(JsonFileStore::new(dir.path())), TTL)
        .issue(&account, t0())
        .await
        .unwrap();

    let reopened = JsonFileStore::new(dir.path());
    assert_eq!(
        reopened.voiceprint(&account).await.unwrap(),
        Some(voiceprint)
    );

    delete_account_records(&reopened, &reopened, &account)
        .await
        .unwrap();
    assert_eq!(reopened.voiceprint(&account).await.unwrap(), None);
    assert_eq!(reopened.otp(&account).await.unwrap(), None);

    // Deleting again is not an error.
    delete_account_records(&reopened, &reopened, &account)
        .await
        .unwrap();
}

#[tokio::test]
async fn unsafe_account_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());

    let result = store.voiceprint(&AccountId::new("../escape")).await;

    assert!(result.is_err());
}
