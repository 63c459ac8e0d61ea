use std::time::Duration;

use tdsro::{ErrorKind, Result, Session, State};

pub async fn main() -> Result<()> {
    let session = Session::connect(tdsro::Config::from_env()).await?;

    // Timeout

    let mut stream = session.execute("WAITFOR DELAY '00:00:10'").await?;
    stream.set_timeout(Some(Duration::from_millis(500)));
    let err = stream.finish().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Timeout(_)));

    // Cancel from another task

    let mut stream = session.execute("WAITFOR DELAY '00:00:10'").await?;
    let handle = stream.cancel_handle();
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel().await
    });

    let err = stream.finish().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Cancelled(_)));
    task.await.expect("cancel task")?;

    // Session survives both

    assert_eq!(session.state(), State::Ready);
    session.execute("SELECT 1").await?.finish().await?;

    // Concurrent exchanges share the connection

    let a = session.execute("WAITFOR DELAY '00:00:01'; SELECT 1").await?;
    let b = session.execute("SELECT 2").await?;
    let (ra, rb) = tokio::join!(drain(a), drain(b));
    ra?;
    rb?;

    session.close().await?;
    Ok(())
}

async fn drain(mut stream: tdsro::LogicalStream) -> Result<u64> {
    stream.finish().await
}
