//! Explicit transactions and savepoints.
use super::{Session, request::{self, Command}};
use crate::{
    Result,
    common::{Marker, debug, lock},
    error::UsageError,
};

/// A savepoint inside the current transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Savepoint {
    id: u32,
    name: Option<String>,
    marker: Marker,
}

impl Savepoint {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name given by the caller.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name the server knows the savepoint by.
    pub fn marker(&self) -> &str {
        self.marker.as_str()
    }
}

impl Session {
    async fn run(&self, command: Command) -> Result<()> {
        let mut stream = request::transaction(&self.shared, command).await?;
        stream.finish().await?;
        Ok(())
    }

    /// Start a transaction, nested calls only increase the depth.
    pub async fn begin_transaction(&self) -> Result<()> {
        self.run(Command::Begin).await?;
        let mut env = lock(&self.shared.env);
        env.depth += 1;
        if env.depth == 1 {
            env.cache.begin();
        }
        debug!("transaction depth {}", env.depth);
        Ok(())
    }

    /// Commit the innermost transaction.
    pub async fn commit(&self) -> Result<()> {
        self.check_transaction("commit outside a transaction")?;
        self.run(Command::Commit).await?;
        let mut env = lock(&self.shared.env);
        env.depth = env.depth.saturating_sub(1);
        if env.depth == 0 {
            env.cache.commit();
            env.savepoints.clear();
        }
        Ok(())
    }

    /// Roll back every open transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.check_transaction("rollback outside a transaction")?;
        self.run(Command::Rollback(None)).await?;
        let mut env = lock(&self.shared.env);
        env.reset_transaction();
        env.cache.rollback();
        Ok(())
    }

    /// Establish a savepoint in the current transaction.
    pub async fn savepoint(&self, name: Option<&str>) -> Result<Savepoint> {
        self.check_transaction("savepoint outside a transaction")?;
        let id = {
            let mut env = lock(&self.shared.env);
            env.next_savepoint += 1;
            env.next_savepoint
        };
        let marker = Marker::new(id);
        self.run(Command::Save(marker.to_string())).await?;

        let mut env = lock(&self.shared.env);
        env.savepoints.push(id);
        env.cache.savepoint(id);
        debug!("savepoint {marker} established");
        Ok(Savepoint { id, name: name.map(Into::into), marker })
    }

    /// Undo everything after `savepoint`.
    ///
    /// The savepoint and every later one are gone afterwards.
    pub async fn rollback_to(&self, savepoint: &Savepoint) -> Result<()> {
        self.savepoint_position(savepoint)?;
        self.run(Command::Rollback(Some(savepoint.marker.to_string()))).await?;

        let mut env = lock(&self.shared.env);
        if let Some(at) = env.savepoints.iter().position(|&id| id == savepoint.id) {
            env.savepoints.truncate(at);
        }
        env.cache.rollback_to(savepoint.id);
        Ok(())
    }

    /// Forget `savepoint`, its work becomes part of the enclosing scope.
    ///
    /// Nothing is sent, the server keeps the savepoint until the
    /// transaction ends.
    pub async fn release_savepoint(&self, savepoint: &Savepoint) -> Result<()> {
        let at = self.savepoint_position(savepoint)?;
        let mut env = lock(&self.shared.env);
        env.savepoints.truncate(at);
        env.cache.release(savepoint.id);
        Ok(())
    }

    fn check_transaction(&self, reason: &'static str) -> Result<()> {
        match lock(&self.shared.env).depth {
            0 => Err(UsageError::new(reason).into()),
            _ => Ok(()),
        }
    }

    fn savepoint_position(&self, savepoint: &Savepoint) -> Result<usize> {
        lock(&self.shared.env)
            .savepoints
            .iter()
            .position(|&id| id == savepoint.id)
            .ok_or_else(|| UsageError::new("unknown savepoint").into())
    }

    /// Savepoints established in the current transaction, oldest first.
    pub fn savepoint_depth(&self) -> usize {
        lock(&self.shared.env).savepoints.len()
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::super::test::{MockServer, connect, done, return_int};
    use crate::{
        Config, ErrorKind, ProcedureCall, Session,
        tds::{token as tag, token::DoneStatus},
    };

    async fn ok(server: &mut MockServer, channel: u16) {
        let mut buf = BytesMut::new();
        done(&mut buf, tag::DONE, DoneStatus::FINAL, 0);
        server.reply(channel, &buf).await;
    }

    /// Run a transaction command the server accepts, returns the SQL sent.
    async fn command<F: Future<Output = crate::Result<T>>, T>(server: &mut MockServer, f: F) -> (T, String) {
        let serve = async {
            let request = server.read().await;
            ok(server, request.channel).await;
            request
        };
        let (result, request) = tokio::join!(f, serve);
        let sql = String::from_utf16_lossy(
            &request.payload.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect::<Vec<_>>(),
        );
        (result.unwrap(), sql)
    }

    async fn prepare(session: &Session, server: &mut MockServer, sql: &str, handle: i32) {
        let (stream, request) = tokio::join!(session.execute(ProcedureCall::prepared(sql)), server.read());
        let mut stream = stream.unwrap();
        let mut buf = BytesMut::new();
        return_int(&mut buf, "@handle", handle);
        done(&mut buf, tag::DONE, DoneStatus::FINAL, 0);
        server.reply(request.channel, &buf).await;
        stream.finish().await.unwrap();
    }

    #[tokio::test]
    async fn depth_follows_commands() {
        let (session, mut server) = connect(Config::default()).await;

        let ((), sql) = command(&mut server, session.begin_transaction()).await;
        assert_eq!(sql, "BEGIN TRAN");
        command(&mut server, session.begin_transaction()).await;
        assert_eq!(session.transaction_depth(), 2);

        let ((), sql) = command(&mut server, session.commit()).await;
        assert_eq!(sql, "COMMIT TRAN");
        assert_eq!(session.transaction_depth(), 1);

        let ((), sql) = command(&mut server, session.rollback()).await;
        assert_eq!(sql, "ROLLBACK TRAN");
        assert!(session.autocommit());
    }

    #[tokio::test]
    async fn savepoint_needs_transaction() {
        let (session, _server) = connect(Config::default()).await;
        let err = session.savepoint(None).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(_)));
        let err = session.commit().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(_)));
    }

    #[tokio::test]
    async fn rollback_to_savepoint_evicts_later_handles() {
        let (session, mut server) = connect(Config::default()).await;

        prepare(&session, &mut server, "select 0", 1).await;
        command(&mut server, session.begin_transaction()).await;
        prepare(&session, &mut server, "select 1", 2).await;

        let (first, sql) = command(&mut server, session.savepoint(Some("first"))).await;
        assert_eq!(sql, format!("SAVE TRAN {}", first.marker()));
        assert_eq!(first.name(), Some("first"));
        prepare(&session, &mut server, "select 2", 3).await;

        let (second, _) = command(&mut server, session.savepoint(None)).await;
        prepare(&session, &mut server, "select 3", 4).await;
        assert_eq!(session.cached_procedures(), 4);

        let ((), sql) = command(&mut server, session.rollback_to(&first)).await;
        assert_eq!(sql, format!("ROLLBACK TRAN {}", first.marker()));
        assert_eq!(session.cached_procedures(), 2);
        assert_eq!(session.savepoint_depth(), 0);

        // gone with the rollback
        let err = session.rollback_to(&second).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Usage(_)));
        assert_eq!(session.transaction_depth(), 1);

        command(&mut server, session.rollback()).await;
        assert_eq!(session.cached_procedures(), 1);
    }

    #[tokio::test]
    async fn released_savepoint_merges_into_transaction() {
        let (session, mut server) = connect(Config::default()).await;

        command(&mut server, session.begin_transaction()).await;
        let (first, _) = command(&mut server, session.savepoint(None)).await;
        let (second, _) = command(&mut server, session.savepoint(None)).await;
        prepare(&session, &mut server, "select 1", 1).await;

        session.release_savepoint(&second).await.unwrap();
        assert_eq!(session.savepoint_depth(), 1);
        assert_eq!(session.cached_procedures(), 1);

        command(&mut server, session.rollback_to(&first)).await;
        assert_eq!(session.cached_procedures(), 0);

        command(&mut server, session.commit()).await;
        assert!(session.autocommit());
    }
}
