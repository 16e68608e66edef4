//! The module containing the UART (serial port) logger implementation.
// Inspired by:
// https://github.com/iankronquist/rustyvisor/blob/83b53ac104d85073858ba83326a28a6e08d1af12/pcuart/src/lib.rs
// Credits: https://github.com/tandasat/Hello-VT-rp/blob/main/hypervisor/src/logger.rs

use {
    crate::{
        config::UART_PORT,
        intel::support::{AccessSize, Cpu, Intel},
    },
    core::{fmt, fmt::Write},
    spin::Mutex,
};

/// Initializes the logger instance.
pub fn init_uart_logger(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&UART_LOGGER).map(|()| log::set_max_level(level))
}

struct UartLogger {
    port: Mutex<Uart<Intel>>,
}

impl UartLogger {
    const fn new(port: UartComPort) -> Self {
        Self {
            port: Mutex::new(Uart::new(port, Intel)),
        }
    }

    fn lock(&self) -> spin::MutexGuard<'_, Uart<Intel>> {
        self.port.lock()
    }
}

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(self.lock(), "{}: {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Uart<C> {
    io_port_base: u16,
    cpu: C,
}

impl<C> Uart<C> {
    const fn new(port: UartComPort, cpu: C) -> Self {
        Self {
            io_port_base: port as u16,
            cpu,
        }
    }
}

impl<C: Cpu> Write for Uart<C> {
    // Writes bytes `string` to the serial port.
    fn write_str(&mut self, string: &str) -> Result<(), fmt::Error> {
        const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
        const UART_OFFSET_LINE_STATUS: u16 = 5;
        const LINE_STATUS_TRANSMITTER_EMPTY: u32 = 0x20;

        for byte in string.bytes() {
            while self.cpu.port_read(self.io_port_base + UART_OFFSET_LINE_STATUS, AccessSize::Byte) & LINE_STATUS_TRANSMITTER_EMPTY == 0 {}
            self.cpu.port_write(
                self.io_port_base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER,
                AccessSize::Byte,
                byte as u32,
            );
        }
        Ok(())
    }
}

/// I/O base of the serial ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum UartComPort {
    Com1 = 0x3f8,
    Com2 = 0x2f8,
    Com3 = 0x3e8,
    Com4 = 0x2e8,
}

static UART_LOGGER: UartLogger = UartLogger::new(UART_PORT);

#[cfg(test)]
mod tests {
    use {super::*, crate::testing::SimulatedCpu};

    #[test]
    fn bytes_go_to_the_holding_register() {
        let mut cpu = SimulatedCpu::new();
        cpu.ports.insert(0x2f8 + 5, 0x60);
        let mut uart = Uart::new(UartComPort::Com2, cpu);

        writeln!(uart, "ok").unwrap();

        let written: Vec<(u16, u32)> = uart.cpu.port_writes.iter().map(|write| (write.0, write.2)).collect();
        assert_eq!(written, vec![(0x2f8, b'o' as u32), (0x2f8, b'k' as u32), (0x2f8, b'\n' as u32)]);
    }
}
