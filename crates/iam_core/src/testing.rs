//! Transportes roteirizados usados nos testes de sessão e supervisor.

use crate::cancel::CancelToken;
use crate::transport::{Connector, LineSource, TransportError};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Telegrama com identificação do monitor (completa o handshake).
pub(crate) const HELLO: &str = "<msg><src>CC128-v0.11</src><dsb>00089</dsb>\
    <sensor>0</sensor><id>900</id><ch1><watts>00010</watts></ch1></msg>";

pub(crate) enum Step {
    Line(String),
    Fail,
}

pub(crate) fn line(s: &str) -> Step {
    Step::Line(s.to_string())
}

/// O que a fonte faz depois que o roteiro acaba.
pub(crate) enum OnEmpty {
    /// Toda leitura falha (cabo desconectado)
    Fail,
    /// Cancela o token e devolve timeout
    Cancel(CancelToken),
    /// Timeout para sempre
    Idle,
}

#[derive(Clone)]
pub(crate) struct ScriptedConnector {
    port: String,
    steps: Arc<Mutex<VecDeque<Step>>>,
    on_empty: Arc<OnEmpty>,
    opens: Arc<AtomicU32>,
    refuse_open: bool,
}

impl ScriptedConnector {
    pub(crate) fn new(port: &str, steps: Vec<Step>, on_empty: OnEmpty) -> Self {
        Self {
            port: port.to_string(),
            steps: Arc::new(Mutex::new(steps.into())),
            on_empty: Arc::new(on_empty),
            opens: Arc::new(AtomicU32::new(0)),
            refuse_open: false,
        }
    }

    pub(crate) fn refusing(port: &str) -> Self {
        Self {
            refuse_open: true,
            ..Self::new(port, vec![], OnEmpty::Fail)
        }
    }

    /// Quantas vezes a porta foi aberta (inclui reconexões).
    pub(crate) fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn port(&self) -> &str {
        &self.port
    }

    fn open(&mut self) -> Result<Box<dyn LineSource>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_open {
            return Err(TransportError::Open {
                port: self.port.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such device"),
            });
        }
        Ok(Box::new(ScriptedSource {
            steps: Arc::clone(&self.steps),
            on_empty: Arc::clone(&self.on_empty),
        }))
    }
}

struct ScriptedSource {
    steps: Arc<Mutex<VecDeque<Step>>>,
    on_empty: Arc<OnEmpty>,
}

impl LineSource for ScriptedSource {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        let next = self.steps.lock().unwrap().pop_front();
        match next {
            Some(Step::Line(l)) => Ok(Some(l)),
            Some(Step::Fail) => Err(io::Error::other("cabo desconectado")),
            None => match self.on_empty.as_ref() {
                OnEmpty::Fail => Err(io::Error::other("cabo desconectado")),
                OnEmpty::Cancel(token) => {
                    token.cancel();
                    Ok(None)
                }
                OnEmpty::Idle => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            },
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}
