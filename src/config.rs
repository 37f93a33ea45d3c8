
/// CSMA/CA tunables, in symbol units unless noted.
#[derive(Debug, Clone, PartialEq)]
pub struct CsmaConfig {
    /// Baud rate of the radio.
    pub symbols_per_sec: u32,
    pub bits_per_symbol: u32,

    /// Consecutive free channel samples required before transmitting.
    pub min_free_samples: u8,
    /// Backoff retry cap; 0 means unbounded.
    pub max_free_samples: u32,

    /// Backoff range bounds after the first draw.
    pub high: u32,
    pub low: u32,
    /// Initial backoff bounds.
    pub init_high: u32,
    pub init_low: u32,

    /// Radio turnaround between carrier sense and transmission.
    pub rxtx_delay: u32,
    /// Base of the binary-exponential backoff; 1 keeps the window flat.
    pub exponent_base: u32,
    pub preamble_length: u32,
    /// Window granted to the receiver for the acknowledgement.
    pub ack_time: u32,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            symbols_per_sec: 65536,
            bits_per_symbol: 4,

            min_free_samples: 1,
            max_free_samples: 0,

            high: 160,
            low: 20,
            init_high: 640,
            init_low: 20,

            rxtx_delay: 11,
            exponent_base: 1,
            preamble_length: 12,
            ack_time: 34,
        }
    }
}

impl CsmaConfig {
    /// Duration of one symbol in seconds.
    pub fn symbol_period(&self) -> f64 {
        1.0 / self.symbols_per_sec as f64
    }

    /// Turnaround delay in seconds.
    pub fn turnaround(&self) -> f64 {
        self.rxtx_delay as f64 * self.symbol_period()
    }

    /// On-air duration of a frame in seconds. Data frames keep the channel
    /// for the ack window as well.
    pub fn frame_duration(&self, bits: u32, with_ack: bool) -> f64 {
        let mut symbols = bits / self.bits_per_symbol + self.preamble_length;
        if with_ack {
            symbols += self.ack_time;
        }
        symbols as f64 * self.symbol_period()
    }

    /// Upper bound of the backoff window after `backoff_count` busy
    /// samples, in symbols.
    pub fn backoff_window(&self, backoff_count: u32) -> f64 {
        let spread = (self.high - self.low) as f64;
        spread * (self.exponent_base as f64).powi(backoff_count as i32)
    }

    /// How long after transmit completion an ack can still arrive.
    pub fn ack_wait(&self) -> f64 {
        (self.ack_time + self.rxtx_delay) as f64 * self.symbol_period()
    }
}

/// Channel model tunables, in dBm.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyConfig {
    /// Mean of the white-noise term added to the floor on every sample.
    pub white_noise_mean: f64,
    /// A channel sampling below this is considered free.
    pub channel_free_threshold: f64,
    /// Margin a transmission must clear over the perceived channel power
    /// to be locked onto.
    pub sensitivity: f64,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            white_noise_mean: 0.0,
            channel_free_threshold: -95.0,
            sensitivity: 4.0,
        }
    }
}

/// Protocol timers (seconds) and the collection goal.
#[derive(Debug, Clone, PartialEq)]
pub struct CtpConfig {
    /// Trickle floor for the beacon interval.
    pub min_beacon_interval: f64,
    /// Trickle ceiling for the beacon interval.
    pub max_beacon_interval: f64,

    /// Period of the route re-evaluation timer.
    pub update_route_period: f64,
    /// Period of local data-packet production.
    pub send_packet_period: f64,

    /// Delay before retransmitting an unacknowledged data packet.
    pub retransmission_offset: f64,
    /// Delay before retrying a send with no route available.
    pub no_route_offset: f64,
    /// Delay before retransmitting after a routing loop was detected.
    pub loop_offset: f64,

    /// Payload sample range.
    pub min_payload: f32,
    pub max_payload: f32,

    /// Packets the root must collect for the simulation to end.
    pub collection_goal: u32,
}

impl Default for CtpConfig {
    fn default() -> Self {
        Self {
            min_beacon_interval: 0.125,
            max_beacon_interval: 512.0,

            update_route_period: 8.0,
            send_packet_period: 1.0,

            retransmission_offset: 0.025,
            no_route_offset: 1.0,
            loop_offset: 0.25,

            min_payload: 0.0,
            max_payload: 100.0,

            collection_goal: 10,
        }
    }
}
