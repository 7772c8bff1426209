//! Commands arriving over the FIFO and host state updates

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Shutdown,
    CheckNow,
    ExecStats,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Shutdown),
            0x02 => Some(Self::CheckNow),
            0x03 => Some(Self::ExecStats),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Self::Shutdown => 0x01,
            Self::CheckNow => 0x02,
            Self::ExecStats => 0x03,
        }
    }
}

/// Transfer layer telling the daemon to hold or resume a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUpdate {
    pub alias: String,
    pub paused: bool,
}

/// Creates the command FIFO unless it exists already.
pub fn ensure_fifo(path: &std::path::Path) -> Result<()> {
    match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => {
            let file_type = std::fs::metadata(path)
                .with_context(|| format!("cannot inspect {:?}", path))?
                .file_type();
            if std::os::unix::fs::FileTypeExt::is_fifo(&file_type) {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{:?} exists and is not a FIFO", path))
            }
        }
        Err(error) => Err(error).with_context(|| format!("failed to create FIFO {:?}", path)),
    }
}

/// Forwards every byte written to the FIFO until cancelled or the receiver goes away.
///
/// The FIFO is opened read-write so it never reports end-of-file between writers.
pub async fn read_fifo(
    path: &std::path::Path,
    sender: tokio::sync::mpsc::Sender<u8>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let mut fifo = tokio::net::unix::pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .with_context(|| format!("failed to open FIFO {:?}", path))?;
    let mut buf = [0u8; 64];
    loop {
        let read = tokio::select! {
            read = fifo.read(&mut buf) => read.with_context(|| format!("failed reading FIFO {:?}", path))?,
            _ = cancel.cancelled() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }
        for byte in &buf[..read] {
            if sender.send(*byte).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes() {
        for command in [Command::Shutdown, Command::CheckNow, Command::ExecStats] {
            assert_eq!(Command::from_byte(command.byte()), Some(command));
        }
        assert_eq!(Command::from_byte(0x00), None);
        assert_eq!(Command::from_byte(0x7f), None);
    }

    #[tokio::test]
    async fn fifo_bytes_are_forwarded() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("cmd.fifo");
        ensure_fifo(&path)?;
        ensure_fifo(&path)?;
        let (sender, mut receiver) = tokio::sync::mpsc::channel(8);
        let cancel = tokio_util::sync::CancellationToken::new();
        let reader = {
            let path = path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { read_fifo(&path, sender, cancel).await })
        };
        let mut writer = tokio::net::unix::pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&path)?;
        tokio::io::AsyncWriteExt::write_all(&mut writer, &[0x02, 0x03]).await?;
        assert_eq!(receiver.recv().await, Some(0x02));
        assert_eq!(receiver.recv().await, Some(0x03));
        cancel.cancel();
        reader.await??;
        Ok(())
    }

    #[test]
    fn plain_file_is_not_a_fifo() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("plain");
        std::fs::write(&path, "").unwrap();
        assert!(ensure_fifo(&path).is_err());
    }
}
