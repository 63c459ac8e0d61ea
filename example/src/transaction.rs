use tdsro::{Batch, Result, Session};

pub async fn main() -> Result<()> {
    let session = Session::connect(tdsro::Config::from_env()).await?;

    session.execute("CREATE TABLE #tx(id int)").await?.finish().await?;

    session.begin_transaction().await?;
    assert!(!session.autocommit());

    session.execute(Batch::new("INSERT INTO #tx VALUES(?)").bind(1)).await?.finish().await?;
    let savepoint = session.savepoint(Some("second insert")).await?;
    session.execute(Batch::new("INSERT INTO #tx VALUES(?)").bind(2)).await?.finish().await?;

    session.rollback_to(&savepoint).await?;
    session.commit().await?;
    assert!(session.autocommit());

    let mut stream = session.execute("SELECT count(*) FROM #tx").await?;
    let row = stream.next_row().await?.expect("one row");
    assert_eq!(row.try_get::<_, i32>(0)?, 1);
    stream.finish().await?;

    session.begin_transaction().await?;
    session.execute("DELETE FROM #tx").await?.finish().await?;
    session.rollback().await?;

    session.close().await?;
    Ok(())
}
