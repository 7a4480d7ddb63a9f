// src/sim/mod.rs - Lumped thermal model of a sectioned heater for simulation runs
use crate::control::SECTION_COUNT;
use crate::gateway::{MemoryGateway, ANALOG_PORT, SECTION_PORTS};

/// Tunables for [`ThermalPlant`].
#[derive(Debug, Clone, Copy)]
pub struct PlantParams {
    /// °F/s gained with every section on and the analog channel on.
    pub max_heat_rate: f64,
    /// Fraction of the excess over ambient lost per second.
    pub loss_coefficient: f64,
    /// Peak-to-peak sensor noise in °F.
    pub noise: f64,
}

impl Default for PlantParams {
    fn default() -> Self {
        Self {
            max_heat_rate: 4.0,
            loss_coefficient: 0.005,
            noise: 0.3,
        }
    }
}

/// One heater body driven by whatever the gateway ports currently say.
#[derive(Debug, Clone)]
pub struct ThermalPlant {
    device_address: String,
    temp: f64,
    ambient: f64,
    params: PlantParams,
}

impl ThermalPlant {
    pub fn new(device_address: &str, ambient: f64, params: PlantParams) -> Self {
        Self {
            device_address: device_address.to_string(),
            temp: ambient,
            ambient,
            params,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temp
    }

    /// Share of full power the ports deliver right now.
    pub fn power(&self, gateway: &MemoryGateway) -> f64 {
        if !gateway.port_state(&self.device_address, ANALOG_PORT) {
            return 0.0;
        }
        let active = SECTION_PORTS
            .iter()
            .filter(|port| gateway.port_state(&self.device_address, **port))
            .count();
        active as f64 / SECTION_COUNT as f64
    }

    /// Advance by `dt` seconds.
    pub fn step(&mut self, gateway: &MemoryGateway, dt: f64) {
        let heat_gain = self.power(gateway) * self.params.max_heat_rate * dt;
        let heat_loss = self.params.loss_coefficient * (self.temp - self.ambient) * dt;
        self.temp += heat_gain - heat_loss;
    }

    /// Sensor reading with noise, never below 1°F.
    pub fn measure(&self) -> f64 {
        let reading = self.temp + self.params.noise * (rand::random::<f64>() - 0.5);
        reading.max(1.0)
    }
}
