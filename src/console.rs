// =============================================================================
// CONSOLE SINK - SAÍDA DE DIAGNÓSTICO
// =============================================================================
//
// Backend de emissão dos macros de log. No kernel completo a saída vai para
// a serial (COM1); este crate não toca hardware, então o kernel hospedeiro
// registra um sink no boot via `set_sink`. Sem sink registrado, tudo é
// descartado silenciosamente.
//
// Restrições herdadas do design de logging:
// - SEM core::fmt (formatação gera código SSE/AVX indesejado no kernel)
// - SEM alocação (apenas strings literais e buffers de pilha)
//
// =============================================================================

use spin::Once;

/// Função de saída registrada pelo kernel hospedeiro.
///
/// Recebe bytes prontos para emissão (texto ASCII e sequências ANSI).
pub type ConsoleSink = fn(&[u8]);

static SINK: Once<ConsoleSink> = Once::new();

/// Registra o sink de saída. Só o primeiro registro tem efeito.
pub fn set_sink(sink: ConsoleSink) {
    SINK.call_once(|| sink);
}

#[inline]
fn sink() -> Option<&'static ConsoleSink> {
    SINK.get()
}

/// Emite uma string.
pub fn emit_str(s: &str) {
    if let Some(out) = sink() {
        out(s.as_bytes());
    }
}

/// Emite quebra de linha (CRLF, compatível com console serial).
pub fn emit_nl() {
    if let Some(out) = sink() {
        out(b"\r\n");
    }
}

/// Emite um valor em hexadecimal com prefixo `0x`.
///
/// Formatação manual, sem `core::fmt`. Zeros à esquerda são suprimidos,
/// mas pelo menos um dígito é sempre emitido.
pub fn emit_hex(value: u64) {
    let out = match sink() {
        Some(out) => out,
        None => return,
    };

    let mut buf = [0u8; 18];
    buf[0] = b'0';
    buf[1] = b'x';
    let mut len = 2;

    let mut started = false;
    let mut shift = 64;
    while shift > 0 {
        shift -= 4;
        let digit = ((value >> shift) & 0xF) as u8;
        if digit != 0 || started || shift == 0 {
            buf[len] = if digit < 10 {
                b'0' + digit
            } else {
                b'a' + (digit - 10)
            };
            len += 1;
            started = true;
        }
    }

    out(&buf[..len]);
}
