use tdsro::{Batch, Param, ProcedureCall, Result, Session, SqlType, Token};

pub async fn main() -> Result<()> {
    let session = Session::connect(tdsro::Config::from_env()).await?;

    // Execute

    session
        .execute("CREATE TABLE #tdsro(id int identity, name nvarchar(50))")
        .await?
        .finish()
        .await?;

    let affected = session
        .execute(Batch::new("INSERT INTO #tdsro(name) VALUES(?)").bind("Deez"))
        .await?
        .finish()
        .await?;

    assert_eq!(affected, 1);

    session.execute("INSERT INTO #tdsro(name) VALUES('Foo')").await?.finish().await?;

    // Rows

    let mut stream = session.execute("SELECT id, name FROM #tdsro ORDER BY id").await?;
    let mut datas = vec![];
    while let Some(row) = stream.next_row().await? {
        datas.push(row.decode::<(i32, String)>()?);
    }

    assert_eq!(datas.len(), 2);
    assert_eq!(datas[0].1.as_str(), "Deez");

    // Tokens

    let mut stream = session.execute("PRINT 'hello'; SELECT 1").await?;
    while let Some(token) = stream.next_token().await? {
        if let Token::Done(done) = token {
            tracing::info!(rows = ?done.rows_affected(), "done");
        }
    }
    assert_eq!(stream.warnings().count(), 1);

    // Prepared statement, the second call reuses the handle

    for name in ["Deez", "Foo"] {
        let call = ProcedureCall::prepared("SELECT id FROM #tdsro WHERE name = ?").bind(name);
        let mut stream = session.execute(call).await?;
        let row = stream.next_row().await?.expect("one row");
        let _id: i32 = row.try_get(0)?;
        stream.finish().await?;
    }

    assert_eq!(session.cached_procedures(), 1);

    // Output parameter

    session
        .execute(
            "CREATE PROCEDURE #tdsro_count @total int OUTPUT AS SELECT @total = count(*) FROM #tdsro",
        )
        .await?
        .finish()
        .await?;

    let call = ProcedureCall::new("#tdsro_count").param(Param::output(SqlType::Int).named("@total"));
    let mut stream = session.execute(call).await?;
    stream.finish().await?;

    let total = stream.param_by_name("total").expect("declared").output_value().clone();
    tracing::info!(?total, status = ?stream.return_status(), "procedure");

    // Error case

    let err = session.execute("SELECT foo FROM nowhere").await?.finish().await.unwrap_err();
    assert!(err.server_messages().is_some());
    assert!(!err.is_fatal());

    session.execute("SELECT 1").await?.finish().await?;
    session.close().await?;

    Ok(())
}
