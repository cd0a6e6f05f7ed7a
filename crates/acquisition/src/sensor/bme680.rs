//! Forced mode driver for the Bosch BME680 gas sensor.
//!
//! Each measurement programs heater profile 0, triggers a single forced
//! conversion, sleeps for the conversion plus heating time and reads the
//! result registers. Compensation uses the floating point formulas from
//! the datasheet.

use std::time::Duration;

use tracing::{debug, info, trace};

use super::{
    Measurement, NotReady, Oversampling, ProbeError, SensorDriver, SensorSample, SensorSettings,
};
use crate::bus::{BusAddress, BusError, BusTransport, Phase};
use crate::clock::Clock;

mod reg {
    pub const RES_HEAT_VAL: u8 = 0x00;
    pub const RES_HEAT_RANGE: u8 = 0x02;
    pub const RANGE_SW_ERR: u8 = 0x04;
    pub const FIELD_0: u8 = 0x1d;
    pub const RES_HEAT_0: u8 = 0x5a;
    pub const GAS_WAIT_0: u8 = 0x64;
    pub const CTRL_GAS_1: u8 = 0x71;
    pub const CTRL_HUM: u8 = 0x72;
    pub const CTRL_MEAS: u8 = 0x74;
    pub const COEFF_1: u8 = 0x89;
    pub const CHIP_ID: u8 = 0xd0;
    pub const SOFT_RESET: u8 = 0xe0;
    pub const COEFF_2: u8 = 0xe1;
}

pub const CHIP_ID: u8 = 0x61;
const SOFT_RESET_CMD: u8 = 0xb6;
const SOFT_RESET_DELAY: Duration = Duration::from_millis(10);

const COEFF_1_LEN: usize = 25;
const COEFF_2_LEN: usize = 16;
const COEFF_LEN: usize = COEFF_1_LEN + COEFF_2_LEN;
const FIELD_LEN: usize = 15;

// status and gas_r_lsb flags
const NEW_DATA: u8 = 0x80;
const GAS_VALID: u8 = 0x20;
const HEAT_STABLE: u8 = 0x10;

const RUN_GAS: u8 = 0x10;
const FORCED_MODE: u8 = 0x01;

/// Heater can not go hotter than this
const MAX_HEATER_TEMPERATURE: u16 = 400;
/// Used for the heater resistance until the first temperature is known
const DEFAULT_AMBIENT: f32 = 25.0;

impl Oversampling {
    fn register_value(self) -> u8 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 3,
            Oversampling::X8 => 4,
            Oversampling::X16 => 5,
        }
    }

    fn cycles(self) -> u32 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

/// Factory trimming read from the sensor's non volatile memory.
#[derive(Debug, Clone, Default, PartialEq)]
struct Calibration {
    t1: u16,
    t2: i16,
    t3: i8,
    p1: u16,
    p2: i16,
    p3: i8,
    p4: i16,
    p5: i16,
    p6: i8,
    p7: i8,
    p8: i16,
    p9: i16,
    p10: u8,
    h1: u16,
    h2: u16,
    h3: i8,
    h4: i8,
    h5: i8,
    h6: u8,
    h7: i8,
    gh1: i8,
    gh2: i16,
    gh3: i8,
    res_heat_range: u8,
    res_heat_val: i8,
    range_sw_err: i8,
}

impl Calibration {
    /// `coeff` is register block 0x89..0xa1 followed by 0xe1..0xf0.
    fn parse(
        coeff: &[u8; COEFF_LEN],
        res_heat_val: u8,
        res_heat_range: u8,
        range_sw_err: u8,
    ) -> Self {
        let u16_at = |lsb: usize| u16::from_le_bytes([coeff[lsb], coeff[lsb + 1]]);
        let i16_at = |lsb: usize| i16::from_le_bytes([coeff[lsb], coeff[lsb + 1]]);
        let i8_at = |idx: usize| coeff[idx] as i8;

        Self {
            t1: u16_at(33),
            t2: i16_at(1),
            t3: i8_at(3),
            p1: u16_at(5),
            p2: i16_at(7),
            p3: i8_at(9),
            p4: i16_at(11),
            p5: i16_at(13),
            p6: i8_at(16),
            p7: i8_at(15),
            p8: i16_at(19),
            p9: i16_at(21),
            p10: coeff[23],
            h1: (u16::from(coeff[27]) << 4) | u16::from(coeff[26] & 0x0f),
            h2: (u16::from(coeff[25]) << 4) | u16::from(coeff[26] >> 4),
            h3: i8_at(28),
            h4: i8_at(29),
            h5: i8_at(30),
            h6: coeff[31],
            h7: i8_at(32),
            gh1: i8_at(37),
            gh2: i16_at(35),
            gh3: i8_at(38),
            res_heat_range: (res_heat_range & 0x30) >> 4,
            res_heat_val: res_heat_val as i8,
            range_sw_err: ((range_sw_err & 0xf0) as i8) / 16,
        }
    }

    /// Returns (t_fine, °C)
    fn temperature(&self, adc: u32) -> (f32, f32) {
        let adc = adc as f32;
        let t1 = f32::from(self.t1);
        let var1 = (adc / 16384.0 - t1 / 1024.0) * f32::from(self.t2);
        let var2 = adc / 131072.0 - t1 / 8192.0;
        let var2 = var2 * var2 * (f32::from(self.t3) * 16.0);
        let t_fine = var1 + var2;
        (t_fine, t_fine / 5120.0)
    }

    /// Pa
    fn pressure(&self, adc: u32, t_fine: f32) -> f32 {
        let mut var1 = t_fine / 2.0 - 64000.0;
        let mut var2 = var1 * var1 * (f32::from(self.p6) / 131072.0);
        var2 += var1 * f32::from(self.p5) * 2.0;
        var2 = var2 / 4.0 + f32::from(self.p4) * 65536.0;
        var1 = (f32::from(self.p3) * var1 * var1 / 16384.0 + f32::from(self.p2) * var1) / 524288.0;
        var1 = (1.0 + var1 / 32768.0) * f32::from(self.p1);

        if var1 == 0.0 {
            return 0.0;
        }

        let mut pressure = 1048576.0 - adc as f32;
        pressure = ((pressure - var2 / 4096.0) * 6250.0) / var1;
        let var1 = f32::from(self.p9) * pressure * pressure / 2147483648.0;
        let var2 = pressure * (f32::from(self.p8) / 32768.0);
        let var3 = (pressure / 256.0).powi(3) * (f32::from(self.p10) / 131072.0);
        pressure + (var1 + var2 + var3 + f32::from(self.p7) * 128.0) / 16.0
    }

    /// %RH
    fn humidity(&self, adc: u16, t_fine: f32) -> f32 {
        let temp = t_fine / 5120.0;
        let var1 = f32::from(adc)
            - (f32::from(self.h1) * 16.0 + (f32::from(self.h3) / 2.0) * temp);
        let var2 = var1
            * ((f32::from(self.h2) / 262144.0)
                * (1.0
                    + (f32::from(self.h4) / 16384.0) * temp
                    + (f32::from(self.h5) / 1048576.0) * temp * temp));
        let var3 = f32::from(self.h6) / 16384.0;
        let var4 = f32::from(self.h7) / 2097152.0;
        (var2 + (var3 + var4 * temp) * var2 * var2).clamp(0.0, 100.0)
    }

    /// Ω
    fn gas_resistance(&self, adc: u16, range: u8) -> f32 {
        const K1: [f32; 16] = [
            0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0, -0.8, 0.0, 0.0, -0.2, -0.5, 0.0, -1.0, 0.0, 0.0,
        ];
        const K2: [f32; 16] = [
            0.0, 0.0, 0.0, 0.0, 0.1, 0.7, 0.0, -0.8, -0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ];

        let range = usize::from(range & 0x0f);
        let var1 = 1340.0 + 5.0 * f32::from(self.range_sw_err);
        let var2 = var1 * (1.0 + K1[range] / 100.0);
        let var3 = 1.0 + K2[range] / 100.0;
        1.0 / (var3
            * 0.000_000_125
            * (1u32 << range) as f32
            * ((f32::from(adc) - 512.0) / var2 + 1.0))
    }

    /// Register value for heater profile 0 to reach `target` °C.
    fn heater_resistance(&self, target: u16, ambient: f32) -> u8 {
        let target = f32::from(target.min(MAX_HEATER_TEMPERATURE));
        let var1 = f32::from(self.gh1) / 16.0 + 49.0;
        let var2 = (f32::from(self.gh2) / 32768.0) * 0.0005 + 0.00235;
        let var3 = f32::from(self.gh3) / 1024.0;
        let var4 = var1 * (1.0 + var2 * target);
        let var5 = var4 + var3 * ambient;
        let res_heat = 3.4
            * (var5
                * (4.0 / (4.0 + f32::from(self.res_heat_range)))
                * (1.0 / (1.0 + f32::from(self.res_heat_val) * 0.002))
                - 25.0);
        res_heat.clamp(0.0, 255.0) as u8
    }
}

/// Gas wait register: 6 bit value with a 2 bit multiplier (1, 4, 16, 64).
fn encode_heater_duration(duration: Duration) -> u8 {
    let mut ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if ms >= 0xfc0 {
        return 0xff;
    }

    let mut factor = 0u8;
    while ms > 0x3f {
        ms /= 4;
        factor += 1;
    }
    ms as u8 + factor * 64
}

/// Conversion time for the configured oversampling plus heating time.
fn measurement_duration(settings: &SensorSettings) -> Duration {
    let cycles = settings.temperature_oversampling.cycles()
        + settings.pressure_oversampling.cycles()
        + settings.humidity_oversampling.cycles();

    let mut micros = cycles * 1963;
    micros += 477 * 4; // TPH switching
    micros += 477 * 5; // gas measurement
    micros += 500; // wake up
    let mut duration = Duration::from_millis(u64::from(micros / 1000 + 1));

    if settings.run_gas {
        duration += settings.heater_duration;
    }
    duration
}

#[derive(Debug, Clone, Copy)]
struct RawField {
    status: u8,
    pressure: u32,
    temperature: u32,
    humidity: u16,
    gas: u16,
    gas_range: u8,
    gas_valid: bool,
    heater_stable: bool,
}

impl RawField {
    fn parse(f: &[u8; FIELD_LEN]) -> Self {
        let adc20 = |msb: usize| {
            (u32::from(f[msb]) << 12) | (u32::from(f[msb + 1]) << 4) | (u32::from(f[msb + 2]) >> 4)
        };
        Self {
            status: f[0],
            pressure: adc20(2),
            temperature: adc20(5),
            humidity: (u16::from(f[8]) << 8) | u16::from(f[9]),
            gas: (u16::from(f[13]) << 2) | u16::from(f[14] >> 6),
            gas_range: f[14] & 0x0f,
            gas_valid: f[14] & GAS_VALID != 0,
            heater_stable: f[14] & HEAT_STABLE != 0,
        }
    }
}

pub struct Bme680<B> {
    bus: B,
    calibration: Option<Calibration>,
    ambient: f32,
}

impl<B: BusTransport> Bme680<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            calibration: None,
            ambient: DEFAULT_AMBIENT,
        }
    }

    pub fn release(self) -> B {
        self.bus
    }

    fn read_array<const N: usize>(&mut self, register: u8) -> Result<[u8; N], BusError> {
        let bytes = self.bus.read(register, N)?;
        let transferred = bytes.len();
        bytes
            .try_into()
            .map_err(|_| BusError::TransferIncomplete {
                register,
                phase: Phase::Read,
                expected: N,
                transferred,
                source: None,
            })
    }

    fn read_calibration(&mut self) -> Result<Calibration, BusError> {
        let first: [u8; COEFF_1_LEN] = self.read_array(reg::COEFF_1)?;
        let second: [u8; COEFF_2_LEN] = self.read_array(reg::COEFF_2)?;
        let mut coeff = [0u8; COEFF_LEN];
        coeff[..COEFF_1_LEN].copy_from_slice(&first);
        coeff[COEFF_1_LEN..].copy_from_slice(&second);

        let [res_heat_val] = self.read_array(reg::RES_HEAT_VAL)?;
        let [res_heat_range] = self.read_array(reg::RES_HEAT_RANGE)?;
        let [range_sw_err] = self.read_array(reg::RANGE_SW_ERR)?;

        let calibration = Calibration::parse(&coeff, res_heat_val, res_heat_range, range_sw_err);
        trace!("calibration: {calibration:?}");
        Ok(calibration)
    }

    fn configure(
        &mut self,
        settings: &SensorSettings,
        calibration: &Calibration,
    ) -> Result<(), BusError> {
        self.bus.write(
            reg::CTRL_HUM,
            &[settings.humidity_oversampling.register_value()],
        )?;

        if settings.run_gas {
            let resistance =
                calibration.heater_resistance(settings.heater_temperature, self.ambient);
            let wait = encode_heater_duration(settings.heater_duration);
            self.bus.write(reg::RES_HEAT_0, &[resistance])?;
            self.bus.write(reg::GAS_WAIT_0, &[wait])?;
            self.bus.write(reg::CTRL_GAS_1, &[RUN_GAS])?;
        } else {
            self.bus.write(reg::CTRL_GAS_1, &[0])?;
        }

        let ctrl_meas = (settings.temperature_oversampling.register_value() << 5)
            | (settings.pressure_oversampling.register_value() << 2)
            | FORCED_MODE;
        self.bus.write(reg::CTRL_MEAS, &[ctrl_meas])
    }
}

impl<B: BusTransport> SensorDriver for Bme680<B> {
    fn bind(&mut self, address: BusAddress) -> Result<(), BusError> {
        self.bus.select(address)
    }

    fn probe(&mut self, clock: &dyn Clock) -> Result<(), ProbeError> {
        let [found] = self.read_array(reg::CHIP_ID)?;
        if found != CHIP_ID {
            return Err(ProbeError::DeviceNotFound {
                expected: CHIP_ID,
                found,
            });
        }

        self.bus.write(reg::SOFT_RESET, &[SOFT_RESET_CMD])?;
        clock.sleep(SOFT_RESET_DELAY);
        self.calibration = Some(self.read_calibration()?);
        info!("found bme680 at {}", self.bus.address());
        Ok(())
    }

    fn measure(
        &mut self,
        settings: &SensorSettings,
        clock: &dyn Clock,
    ) -> Result<Measurement, BusError> {
        let calibration = match self.calibration.take() {
            Some(calibration) => calibration,
            None => self.read_calibration()?,
        };
        let res = self.measure_with(settings, clock, &calibration);
        self.calibration = Some(calibration);
        res
    }
}

impl<B: BusTransport> Bme680<B> {
    fn measure_with(
        &mut self,
        settings: &SensorSettings,
        clock: &dyn Clock,
        calibration: &Calibration,
    ) -> Result<Measurement, BusError> {
        self.configure(settings, calibration)?;
        clock.sleep(measurement_duration(settings));

        let field: [u8; FIELD_LEN] = self.read_array(reg::FIELD_0)?;
        let timestamp = clock.now();
        let raw = RawField::parse(&field);

        if raw.status & NEW_DATA == 0 {
            debug!("no new data after forced measurement, status: {:#04x}", raw.status);
            return Ok(Measurement::NotReady(NotReady::DataNotReady));
        }
        if settings.run_gas && !raw.heater_stable {
            return Ok(Measurement::NotReady(NotReady::HeaterUnstable));
        }
        if settings.run_gas && !raw.gas_valid {
            return Ok(Measurement::NotReady(NotReady::DataNotReady));
        }

        let (t_fine, temperature) = calibration.temperature(raw.temperature);
        self.ambient = temperature;

        let gas_resistance = if settings.run_gas {
            calibration.gas_resistance(raw.gas, raw.gas_range)
        } else {
            f32::NAN
        };

        Ok(Measurement::Ready(SensorSample {
            timestamp,
            temperature,
            pressure: calibration.pressure(raw.pressure, t_fine),
            humidity: calibration.humidity(raw.humidity, t_fine),
            gas_resistance,
            heater_stable: raw.heater_stable,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::clock::Timestamp;

    const COEFF_1: [u8; COEFF_1_LEN] = [
        0x00, 0xc1, 0x66, 0x03, 0x00, 0x7d, 0x8e, 0x43, 0xd6, 0x58, 0x00, 0x78, 0x1b, 0xaf, 0xff,
        0x37, 0x1e, 0x00, 0x00, 0xfd, 0xff, 0xa9, 0xf6, 0x1e, 0x00,
    ];
    const COEFF_2: [u8; COEFF_2_LEN] = [
        0x3f, 0xbc, 0x2f, 0x00, 0x2d, 0x14, 0x78, 0x9c, 0xd0, 0x65, 0xaf, 0xe8, 0xe2, 0x12, 0x00,
        0x00,
    ];
    const RES_HEAT_VAL: u8 = 40;
    const RES_HEAT_RANGE: u8 = 0x10;

    fn calibration() -> Calibration {
        let mut coeff = [0u8; COEFF_LEN];
        coeff[..COEFF_1_LEN].copy_from_slice(&COEFF_1);
        coeff[COEFF_1_LEN..].copy_from_slice(&COEFF_2);
        Calibration::parse(&coeff, RES_HEAT_VAL, RES_HEAT_RANGE, 0)
    }

    fn assert_close(value: f32, expected: f32) {
        let tolerance = expected.abs() * 1e-3;
        assert!(
            (value - expected).abs() <= tolerance,
            "{value} is not within {tolerance} of {expected}"
        );
    }

    /// Register file of a bme680 that answers every forced measurement
    /// with the same result registers.
    struct RegisterBus {
        memory: [u8; 256],
        address: BusAddress,
        writes: Vec<(u8, Vec<u8>)>,
        /// reads from this register come back one byte short
        short_read: Option<u8>,
    }

    impl RegisterBus {
        fn new(field: [u8; FIELD_LEN]) -> Self {
            let mut memory = [0u8; 256];
            memory[usize::from(reg::CHIP_ID)] = CHIP_ID;
            let coeff_1 = usize::from(reg::COEFF_1);
            memory[coeff_1..coeff_1 + COEFF_1_LEN].copy_from_slice(&COEFF_1);
            let coeff_2 = usize::from(reg::COEFF_2);
            memory[coeff_2..coeff_2 + COEFF_2_LEN].copy_from_slice(&COEFF_2);
            memory[usize::from(reg::RES_HEAT_VAL)] = RES_HEAT_VAL;
            memory[usize::from(reg::RES_HEAT_RANGE)] = RES_HEAT_RANGE;
            let field_0 = usize::from(reg::FIELD_0);
            memory[field_0..field_0 + FIELD_LEN].copy_from_slice(&field);
            Self {
                memory,
                address: BusAddress::SECONDARY,
                writes: Vec::new(),
                short_read: None,
            }
        }

        fn written(&self, register: u8) -> Option<&[u8]> {
            self.writes
                .iter()
                .rev()
                .find(|(r, _)| *r == register)
                .map(|(_, data)| data.as_slice())
        }
    }

    impl BusTransport for RegisterBus {
        fn address(&self) -> BusAddress {
            self.address
        }
        fn select(&mut self, address: BusAddress) -> Result<(), BusError> {
            self.address = address;
            Ok(())
        }
        fn write(&mut self, register: u8, payload: &[u8]) -> Result<(), BusError> {
            self.writes.push((register, payload.to_vec()));
            Ok(())
        }
        fn read(&mut self, register: u8, len: usize) -> Result<Vec<u8>, BusError> {
            let start = usize::from(register);
            let len = if self.short_read == Some(register) {
                len - 1
            } else {
                len
            };
            Ok(self.memory[start..start + len].to_vec())
        }
    }

    #[derive(Default)]
    struct StepClock {
        now: Cell<i64>,
        slept: Cell<Duration>,
    }

    impl Clock for StepClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_micros(self.now.get())
        }
        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration.as_micros() as i64);
            self.slept.set(self.slept.get() + duration);
        }
    }

    fn settings() -> SensorSettings {
        SensorSettings {
            next_call: Timestamp::default(),
            heater_temperature: 320,
            heater_duration: Duration::from_millis(197),
            run_gas: true,
            temperature_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X16,
            humidity_oversampling: Oversampling::X1,
        }
    }

    /// temperature adc 500000, pressure adc 415148, humidity adc 22000,
    /// gas adc 600 in range 4
    fn field(status: u8, gas_flags: u8) -> [u8; FIELD_LEN] {
        let pressure: u32 = 415148;
        let temperature: u32 = 500000;
        let humidity: u16 = 22000;
        let gas: u16 = 600;
        [
            status,
            0,
            (pressure >> 12) as u8,
            (pressure >> 4) as u8,
            ((pressure & 0x0f) << 4) as u8,
            (temperature >> 12) as u8,
            (temperature >> 4) as u8,
            ((temperature & 0x0f) << 4) as u8,
            (humidity >> 8) as u8,
            humidity as u8,
            0,
            0,
            0,
            (gas >> 2) as u8,
            (((gas & 0x03) << 6) as u8) | gas_flags | 4,
        ]
    }

    #[test]
    fn parses_calibration() {
        let cal = calibration();
        assert_eq!(cal.t1, 26064);
        assert_eq!(cal.t2, 26305);
        assert_eq!(cal.p9, -2391);
        assert_eq!(cal.h1, 764);
        assert_eq!(cal.h2, 1019);
        assert_eq!(cal.h7, -100);
        assert_eq!(cal.gh1, -30);
        assert_eq!(cal.gh2, -5969);
        assert_eq!(cal.res_heat_range, 1);
    }

    #[test]
    fn compensates_readings() {
        let cal = calibration();
        let (t_fine, temperature) = cal.temperature(500000);
        assert_close(t_fine, 133239.68);
        assert_close(temperature, 26.0234);
        assert_close(cal.pressure(415148, t_fine), 89896.68);
        assert_close(cal.humidity(22000, t_fine), 51.538);
        assert_close(cal.gas_resistance(600, 4), 468718.96);
        assert_close(cal.gas_resistance(300, 10), 9284.30);
    }

    #[test]
    fn humidity_is_clamped() {
        let cal = calibration();
        let (t_fine, _) = cal.temperature(500000);
        assert_eq!(cal.humidity(0, t_fine), 0.0);
        assert_eq!(cal.humidity(u16::MAX, t_fine), 100.0);
    }

    #[test]
    fn heater_resistance_for_profile() {
        let cal = calibration();
        assert_eq!(cal.heater_resistance(320, 25.0), 120);
        assert_eq!(
            cal.heater_resistance(1000, 25.0),
            cal.heater_resistance(MAX_HEATER_TEMPERATURE, 25.0)
        );
    }

    #[test]
    fn encodes_heater_duration() {
        let cases = [(0, 0), (63, 63), (100, 89), (197, 113), (4032, 0xff), (9000, 0xff)];
        for (ms, encoded) in cases {
            assert_eq!(encode_heater_duration(Duration::from_millis(ms)), encoded, "{ms} ms");
        }
    }

    #[test]
    fn duration_includes_heating() {
        let mut settings = settings();
        // (2 + 16 + 1) * 1963 + 477 * 9 + 500 = 42090us
        assert_eq!(measurement_duration(&settings), Duration::from_millis(43 + 197));
        settings.run_gas = false;
        assert_eq!(measurement_duration(&settings), Duration::from_millis(43));
    }

    #[test]
    fn probe_rejects_other_chip() {
        let mut bus = RegisterBus::new(field(NEW_DATA, GAS_VALID | HEAT_STABLE));
        bus.memory[usize::from(reg::CHIP_ID)] = 0x60;
        let mut driver = Bme680::new(bus);

        let err = driver.probe(&StepClock::default()).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::DeviceNotFound {
                expected: CHIP_ID,
                found: 0x60
            }
        ));
    }

    #[test]
    fn forced_measurement() {
        let bus = RegisterBus::new(field(NEW_DATA, GAS_VALID | HEAT_STABLE));
        let mut driver = Bme680::new(bus);
        let clock = StepClock::default();
        driver.probe(&clock).unwrap();

        let Measurement::Ready(sample) = driver.measure(&settings(), &clock).unwrap() else {
            panic!("sensor flagged new data with a stable heater");
        };
        assert_close(sample.temperature, 26.0234);
        assert_close(sample.pressure, 89896.68);
        assert_close(sample.humidity, 51.538);
        assert_close(sample.gas_resistance, 468718.96);
        assert!(sample.heater_stable);
        assert_eq!(sample.timestamp, clock.now());

        let bus = driver.release();
        assert_eq!(bus.written(reg::SOFT_RESET), Some([SOFT_RESET_CMD].as_slice()));
        assert_eq!(bus.written(reg::GAS_WAIT_0), Some([113].as_slice()));
        assert_eq!(bus.written(reg::CTRL_GAS_1), Some([RUN_GAS].as_slice()));
        assert_eq!(
            bus.written(reg::CTRL_MEAS),
            Some([(2 << 5) | (5 << 2) | FORCED_MODE].as_slice())
        );
    }

    #[test]
    fn sleeps_for_conversion() {
        let bus = RegisterBus::new(field(NEW_DATA, GAS_VALID | HEAT_STABLE));
        let mut driver = Bme680::new(bus);
        let clock = StepClock::default();
        driver.probe(&clock).unwrap();
        clock.slept.set(Duration::ZERO);

        driver.measure(&settings(), &clock).unwrap();
        assert_eq!(clock.slept.get(), measurement_duration(&settings()));
    }

    #[test]
    fn unstable_heater_is_not_ready() {
        let bus = RegisterBus::new(field(NEW_DATA, GAS_VALID));
        let mut driver = Bme680::new(bus);
        let clock = StepClock::default();
        driver.probe(&clock).unwrap();

        assert_eq!(
            driver.measure(&settings(), &clock).unwrap(),
            Measurement::NotReady(NotReady::HeaterUnstable)
        );
    }

    #[test]
    fn missing_new_data_is_not_ready() {
        let bus = RegisterBus::new(field(0, GAS_VALID | HEAT_STABLE));
        let mut driver = Bme680::new(bus);
        let clock = StepClock::default();
        driver.probe(&clock).unwrap();

        assert_eq!(
            driver.measure(&settings(), &clock).unwrap(),
            Measurement::NotReady(NotReady::DataNotReady)
        );
    }

    #[test]
    fn short_field_read_yields_no_sample() {
        let mut bus = RegisterBus::new(field(NEW_DATA, GAS_VALID | HEAT_STABLE));
        bus.short_read = Some(reg::FIELD_0);
        let mut driver = Bme680::new(bus);
        let clock = StepClock::default();
        driver.probe(&clock).unwrap();

        let err = driver.measure(&settings(), &clock).unwrap_err();
        assert!(matches!(
            err,
            BusError::TransferIncomplete {
                register: reg::FIELD_0,
                phase: Phase::Read,
                expected: FIELD_LEN,
                transferred: 14,
                ..
            }
        ));
    }
}
