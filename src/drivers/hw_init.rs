//! Raw ESP-IDF peripheral access.
//!
//! Configures ADC1, GPIO outputs and LEDC timers/channels on demand using
//! raw sys calls.  Only [`EspHardware`](crate::adapters::hardware::EspHardware)
//! calls into this module; everything else goes through the
//! [`HardwarePort`](crate::app::ports::HardwarePort) trait.

use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use esp_idf_svc::sys::*;
use log::info;

use crate::app::ports::HalError;
use crate::pins;

// ── ADC1 (oneshot) ────────────────────────────────────────────

static ADC1_HANDLE: AtomicPtr<adc_oneshot_unit_ctx_t> = AtomicPtr::new(core::ptr::null_mut());
/// Bit n set once ADC1 channel n has been configured.
static ADC1_CONFIGURED: AtomicU8 = AtomicU8::new(0);

/// Create the ADC1 oneshot unit.  Idempotent.
pub fn init_adc1() -> Result<(), HalError> {
    if !ADC1_HANDLE.load(Ordering::Acquire).is_null() {
        return Ok(());
    }
    let init_cfg = adc_oneshot_unit_init_cfg_t {
        unit_id: adc_unit_t_ADC_UNIT_1,
        ulp_mode: adc_ulp_mode_t_ADC_ULP_MODE_DISABLE,
        ..Default::default()
    };
    let mut handle: adc_oneshot_unit_handle_t = core::ptr::null_mut();
    // SAFETY: init_cfg and handle outlive the call.
    let ret = unsafe { adc_oneshot_new_unit(&init_cfg, &mut handle) };
    if ret != ESP_OK as i32 {
        return Err(HalError::Adc(-1));
    }
    ADC1_HANDLE.store(handle, Ordering::Release);
    info!("hw_init: ADC1 oneshot unit created");
    Ok(())
}

/// Sample an ADC1 pin, configuring its channel on first use.
pub fn adc1_read(pin: i32) -> Result<u16, HalError> {
    let channel = pins::adc1_channel(pin).ok_or(HalError::InvalidPin(pin))?;
    init_adc1()?;
    let handle = ADC1_HANDLE.load(Ordering::Acquire);

    let bit = 1u8 << channel;
    if ADC1_CONFIGURED.load(Ordering::Acquire) & bit == 0 {
        let chan_cfg = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        // SAFETY: handle was created by init_adc1 and is never freed.
        let ret = unsafe { adc_oneshot_config_channel(handle, channel, &chan_cfg) };
        if ret != ESP_OK as i32 {
            return Err(HalError::Adc(pin));
        }
        ADC1_CONFIGURED.fetch_or(bit, Ordering::AcqRel);
    }

    let mut raw: i32 = 0;
    // SAFETY: oneshot reads are serialised by the driver's internal lock.
    let ret = unsafe { adc_oneshot_read(handle, channel, &mut raw) };
    if ret != ESP_OK as i32 {
        return Err(HalError::Adc(pin));
    }
    Ok(raw.clamp(0, i32::from(pins::ADC_MAX_RAW)) as u16)
}

// ── GPIO Outputs ──────────────────────────────────────────────

pub fn gpio_configure_output(pin: i32) -> Result<(), HalError> {
    if !pins::is_output_gpio(pin) {
        return Err(HalError::InvalidPin(pin));
    }
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: cfg is a valid, fully-initialised config for an output pin.
    let ret = unsafe { gpio_config(&cfg) };
    if ret != ESP_OK as i32 {
        return Err(HalError::Gpio(pin));
    }
    Ok(())
}

pub fn gpio_write(pin: i32, high: bool) -> Result<(), HalError> {
    // SAFETY: gpio_set_level validates the pin number itself.
    let ret = unsafe { gpio_set_level(pin, u32::from(high)) };
    if ret != ESP_OK as i32 {
        return Err(HalError::Gpio(pin));
    }
    Ok(())
}

// ── LEDC PWM ─────────────────────────────────────────────────

/// Channel n runs on timer n % 4 so outputs can have distinct frequencies.
fn timer_for(channel: u8) -> ledc_timer_t {
    ledc_timer_t_LEDC_TIMER_0 + u32::from(channel % 4)
}

pub fn ledc_configure(pin: i32, channel: u8, frequency_hz: u32, resolution_bits: u8) -> Result<(), HalError> {
    if !pins::is_output_gpio(pin) {
        return Err(HalError::InvalidPin(pin));
    }
    let timer = ledc_timer_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        timer_num: timer_for(channel),
        duty_resolution: u32::from(resolution_bits),
        freq_hz: frequency_hz,
        clk_cfg: soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
        ..Default::default()
    };
    // SAFETY: timer config is fully initialised.
    if unsafe { ledc_timer_config(&timer) } != ESP_OK as i32 {
        return Err(HalError::Pwm(channel));
    }
    let chan = ledc_channel_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        channel: u32::from(channel),
        timer_sel: timer_for(channel),
        gpio_num: pin,
        duty: 0,
        hpoint: 0,
        ..Default::default()
    };
    // SAFETY: channel config is fully initialised; pin checked above.
    if unsafe { ledc_channel_config(&chan) } != ESP_OK as i32 {
        return Err(HalError::Pwm(channel));
    }
    info!("hw_init: LEDC CH{channel} -> GPIO{pin} @ {frequency_hz} Hz, {resolution_bits}-bit");
    Ok(())
}

pub fn ledc_set(channel: u8, duty: u32) -> Result<(), HalError> {
    // SAFETY: duty register writes on a configured channel.
    unsafe {
        if ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, u32::from(channel), duty) != ESP_OK as i32 {
            return Err(HalError::Pwm(channel));
        }
        if ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, u32::from(channel)) != ESP_OK as i32 {
            return Err(HalError::Pwm(channel));
        }
    }
    Ok(())
}
