use async_trait::async_trait;
use firmata_shared::{Transport, TransportError, TransportEvent};
use serial2_tokio::SerialPort;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Serial port transport using serial2-tokio
pub struct SerialTransport {
    port: Arc<SerialPort>,
    path: String,
    write_lock: Mutex<()>,
}

impl SerialTransport {
    /// Open `path` and start the reader task. Inbound chunks and lifecycle
    /// signals arrive on the returned receiver, starting with `Open`.
    pub fn open(path: &str, baud: u32) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let port = Arc::new(SerialPort::open(path, baud)?);
        let (tx, rx) = mpsc::channel(256);
        tracing::info!("opened serial port {} at {} baud", path, baud);

        let reader = port.clone();
        let name = path.to_string();
        tokio::spawn(async move {
            if tx.send(TransportEvent::Open).await.is_err() {
                return;
            }
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        tracing::info!("serial port {} closed by remote", name);
                        let _ = tx.send(TransportEvent::Disconnect).await;
                        break;
                    }
                    Ok(n) => {
                        tracing::trace!("RX {:02X?}", &buf[..n]);
                        if tx.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        tracing::error!("serial read error on {}: {}", name, e);
                        let _ = tx.send(TransportEvent::Error(e.to_string())).await;
                        let _ = tx.send(TransportEvent::Disconnect).await;
                        break;
                    }
                }
            }
        });

        Ok((Self { port, path: path.to_string(), write_lock: Mutex::new(()) }, rx))
    }

    pub fn available_ports() -> Vec<String> {
        match SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(_) => vec![],
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let _guard = self.write_lock.lock().await;
        let mut written = 0;
        while written < bytes.len() {
            match self.port.write(&bytes[written..]).await? {
                0 => return Err(TransportError::Closed),
                n => written += n,
            }
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.path.clone()
    }
}
