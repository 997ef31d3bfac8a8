use tracing::{error, info};

use microdlna::config::Config;
use microdlna::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    info!("starting microdlna, publishing {}", config.media_dir.display());

    if let Some(uid_name) = &config.uid {
        if let Err(e) = drop_privileges(uid_name) {
            error!("failed to drop privileges to {uid_name}: {e}");
            return Err(e);
        }
    }

    server::run(config).await
}

#[cfg(unix)]
fn drop_privileges(uid_name: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::ffi::CString;

    let cname = CString::new(uid_name).context("invalid user name")?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        anyhow::bail!("unknown user: {uid_name}");
    }
    let (uid, gid) = unsafe { ((*pw).pw_uid, (*pw).pw_gid) };
    if unsafe { libc::setgid(gid) } != 0 {
        anyhow::bail!("setgid failed for {uid_name}");
    }
    if unsafe { libc::setuid(uid) } != 0 {
        anyhow::bail!("setuid failed for {uid_name}");
    }
    Ok(())
}
