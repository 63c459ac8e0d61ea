use tdsro::{Config, Result, Session, State};

pub async fn main() -> Result<()> {
    let config = Config::from_env();

    let session = Session::connect(config.clone()).await?;
    assert_eq!(session.state(), State::Ready);
    tracing::info!(
        version = %session.version(),
        packet_size = session.packet_size(),
        database = %session.database(),
        "connected"
    );

    session.execute("SELECT 1").await?.finish().await?;
    session.close().await?;
    assert_eq!(session.state(), State::Disconnected);

    // explicit values win over the environment
    let session = Session::connect(config.packet_size(512).app_name("tdsro-example")).await?;
    session.execute("SELECT 1").await?.finish().await?;
    session.close().await?;

    Ok(())
}
