//! HD44780 character LCD behind a PCF8574 I2C backpack.
//!
//! Backpack pins: P0 = RS, P1 = RW, P2 = E, P3 = backlight, P4..P7 = D4..D7.
//! The controller is driven in 4-bit mode and never read back, so RW stays low.

use esp_idf_hal::{
    delay::{Ets, FreeRtos, BLOCK},
    i2c::I2cDriver,
    sys::EspError,
};
use log::warn;

use clock_common::CharDisplay;

pub const PCF8574_ADDRESS: u8 = 0x27;

const LCD_RS: u8 = 0x01;
const LCD_ENABLE: u8 = 0x04;
const LCD_BACKLIGHT: u8 = 0x08;

const CMD_CLEAR: u8 = 0x01;
const CMD_ENTRY_INCREMENT: u8 = 0x06;
const CMD_DISPLAY_ON: u8 = 0x0C;
const CMD_FUNCTION_4BIT_2LINE: u8 = 0x28;
const CMD_SET_DDRAM: u8 = 0x80;

const ROW_OFFSETS: [u8; 4] = [0x00, 0x40, 0x14, 0x54];

pub struct I2cLcd<'d> {
    i2c: I2cDriver<'d>,
    address: u8,
    rows: u8,
    cols: u8,
    backlight: bool,
}

impl<'d> I2cLcd<'d> {
    pub fn new(i2c: I2cDriver<'d>, address: u8, rows: u8, cols: u8) -> Result<Self, EspError> {
        let mut lcd = Self {
            i2c,
            address,
            rows: rows.min(ROW_OFFSETS.len() as u8),
            cols,
            backlight: true,
        };
        lcd.init()?;
        Ok(lcd)
    }

    fn init(&mut self) -> Result<(), EspError> {
        FreeRtos::delay_ms(50);

        // Force 8-bit mode three times, then switch to 4-bit.
        self.send_nibble(0x03, false)?;
        FreeRtos::delay_ms(5);
        self.send_nibble(0x03, false)?;
        Ets::delay_us(150);
        self.send_nibble(0x03, false)?;
        self.send_nibble(0x02, false)?;

        self.command(CMD_FUNCTION_4BIT_2LINE)?;
        self.command(CMD_DISPLAY_ON)?;
        self.command(CMD_CLEAR)?;
        FreeRtos::delay_ms(2);
        self.command(CMD_ENTRY_INCREMENT)
    }

    fn backlight_bit(&self) -> u8 {
        if self.backlight {
            LCD_BACKLIGHT
        } else {
            0
        }
    }

    fn send_nibble(&mut self, nibble: u8, data: bool) -> Result<(), EspError> {
        let rs = if data { LCD_RS } else { 0 };
        let byte = (nibble << 4) | rs | self.backlight_bit();

        self.i2c.write(self.address, &[byte | LCD_ENABLE], BLOCK)?;
        Ets::delay_us(1);
        self.i2c.write(self.address, &[byte], BLOCK)?;
        Ets::delay_us(50);
        Ok(())
    }

    fn send_byte(&mut self, byte: u8, data: bool) -> Result<(), EspError> {
        self.send_nibble(byte >> 4, data)?;
        self.send_nibble(byte & 0x0F, data)
    }

    fn command(&mut self, command: u8) -> Result<(), EspError> {
        self.send_byte(command, false)
    }

    fn print_at(&mut self, text: &str, row: u8, col: u8) -> Result<(), EspError> {
        let Some(offset) = ROW_OFFSETS.get(usize::from(row)) else {
            return Ok(());
        };
        if row >= self.rows || col >= self.cols {
            return Ok(());
        }

        self.command(CMD_SET_DDRAM | (offset + col))?;
        let room = usize::from(self.cols - col);
        for ch in text.chars().take(room) {
            let code = if ch.is_ascii() { ch as u8 } else { b'?' };
            self.send_byte(code, true)?;
        }
        Ok(())
    }
}

impl CharDisplay for I2cLcd<'_> {
    fn clear(&mut self) {
        if let Err(err) = self.command(CMD_CLEAR) {
            warn!("lcd clear failed: {err}");
        }
        FreeRtos::delay_ms(2);
    }

    fn write(&mut self, text: &str, row: u8, col: u8) {
        if let Err(err) = self.print_at(text, row, col) {
            warn!("lcd write on row {row} failed: {err}");
        }
    }

    fn backlight(&mut self, on: bool) {
        self.backlight = on;
        let byte = self.backlight_bit();
        if let Err(err) = self.i2c.write(self.address, &[byte], BLOCK) {
            warn!("lcd backlight update failed: {err}");
        }
    }

    fn backlight_state(&self) -> bool {
        self.backlight
    }
}
