//! Estatísticas de intervalo entre chegadas de um sensor.
//!
//! Útil para achar IAMs que transmitem de forma intermitente. Média
//! incremental, memória O(1): nenhum histórico é guardado.

/// Média/mín/máx/último intervalo (segundos) entre leituras de um sensor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
    last_interval: Option<f64>,
    last_seen: Option<f64>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra uma chegada em `now` (segundos Unix) e devolve o intervalo
    /// desde a chegada anterior. A primeira chegada só marca o instante.
    pub fn record_arrival(&mut self, now: f64) -> Option<f64> {
        let interval = self.last_seen.map(|previous| now - previous);
        if let Some(x) = interval {
            self.push_interval(x);
        }
        self.last_seen = Some(now);
        interval
    }

    /// Acrescenta um intervalo à estatística.
    pub fn push_interval(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.mean = x;
            self.min = x;
            self.max = x;
        } else {
            let n = self.count as f64;
            self.mean = (self.mean * (n - 1.0) + x) / n;
            if x < self.min {
                self.min = x;
            }
            if x > self.max {
                self.max = x;
            }
        }
        self.last_interval = Some(x);
    }

    /// Número de intervalos observados.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn last_interval(&self) -> Option<f64> {
        self.last_interval
    }

    /// Instante (segundos Unix) da última chegada.
    pub fn last_seen(&self) -> Option<f64> {
        self.last_seen
    }
}
