use std::sync::Arc;

use botfoundry::models::account::Account;
use botfoundry::persistence::{account_repo::AccountRepo, db};
use botfoundry::AppError;

#[tokio::test]
async fn create_and_load_account() {
    let pool = db::connect_memory().await.expect("db connect");
    let repo = AccountRepo::new(Arc::new(pool));

    let account = Account::new(10_000);
    repo.create(&account).await.expect("create account");

    let loaded = repo.load(&account.id).await.expect("load account");
    assert_eq!(loaded.balance, 10_000);
    assert_eq!(loaded.total_spent, 0);
}

#[tokio::test]
async fn load_unknown_is_not_found() {
    let pool = db::connect_memory().await.expect("db connect");
    let repo = AccountRepo::new(Arc::new(pool));

    let result = repo.load("missing").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn credit_tops_up_balance() {
    let pool = db::connect_memory().await.expect("db connect");
    let repo = AccountRepo::new(Arc::new(pool));

    let account = Account::new(100);
    repo.create(&account).await.expect("create");

    let updated = repo.credit(&account.id, 900).await.expect("credit");
    assert_eq!(updated.balance, 1000);
}

#[tokio::test]
async fn non_positive_credit_is_rejected() {
    let pool = db::connect_memory().await.expect("db connect");
    let repo = AccountRepo::new(Arc::new(pool));

    let account = Account::new(100);
    repo.create(&account).await.expect("create");

    assert!(matches!(
        repo.credit(&account.id, 0).await,
        Err(AppError::Config(_))
    ));
    assert!(matches!(
        repo.credit(&account.id, -5).await,
        Err(AppError::Config(_))
    ));
}

#[tokio::test]
async fn credit_unknown_account_is_not_found() {
    let pool = db::connect_memory().await.expect("db connect");
    let repo = AccountRepo::new(Arc::new(pool));

    let result = repo.credit("missing", 100).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}
