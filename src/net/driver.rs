use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::info;

use crate::net::host::Host;


/// Steps the host until it is asked to terminate. Intended to run on its own task,
///  separate from the simulation loop; the two only communicate through the host's
///  tables.
pub async fn run_host(host: Arc<Host>) {
    let interval = host.config().step_interval;
    loop {
        if host.is_terminating().await {
            break;
        }
        host.step().await;
        sleep(interval).await;
    }
    info!("dispatcher loop for {:?} finished", host);
}

pub fn spawn_host(host: Arc<Host>) -> JoinHandle<()> {
    tokio::spawn(run_host(host))
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::net::host::Role;
    use crate::net::net_config::NetConfig;
    use crate::test_util::transport::{test_addr, InMemHub};

    use super::*;

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_run_host_exits_on_termination() {
        let hub = InMemHub::new();
        let host = Host::new(Role::Authority, Arc::new(NetConfig::new()), hub.endpoint(test_addr(1)));
        host.open().await;

        let driver = spawn_host(host.clone());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!driver.is_finished());

        host.shutdown().await;
        driver.await.unwrap();
    }
}
