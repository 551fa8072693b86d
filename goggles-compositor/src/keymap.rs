//! A built-in us/pc XKB keymap served to guest keyboards.
//!
//! The host forwards raw linux keycodes, so the guest only needs a
//! keymap that resolves the usual evdev codes (keycode = linux + 8).
//! Serving a fixed map from a memfd avoids pulling a native xkbcommon
//! dependency into the compositor.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

const KEYMAP: &str = r#"xkb_keymap {
xkb_keycodes "goggles" {
    minimum = 8;
    maximum = 255;
    <ESC> = 9;
    <AE01> = 10; <AE02> = 11; <AE03> = 12; <AE04> = 13; <AE05> = 14;
    <AE06> = 15; <AE07> = 16; <AE08> = 17; <AE09> = 18; <AE10> = 19;
    <AE11> = 20; <AE12> = 21;
    <BKSP> = 22;
    <TAB> = 23;
    <AD01> = 24; <AD02> = 25; <AD03> = 26; <AD04> = 27; <AD05> = 28;
    <AD06> = 29; <AD07> = 30; <AD08> = 31; <AD09> = 32; <AD10> = 33;
    <RTRN> = 36;
    <LCTL> = 37;
    <AC01> = 38; <AC02> = 39; <AC03> = 40; <AC04> = 41; <AC05> = 42;
    <AC06> = 43; <AC07> = 44; <AC08> = 45; <AC09> = 46; <AC10> = 47;
    <LFSH> = 50;
    <AB01> = 52; <AB02> = 53; <AB03> = 54; <AB04> = 55; <AB05> = 56;
    <AB06> = 57; <AB07> = 58; <AB08> = 59; <AB09> = 60; <AB10> = 61;
    <RTSH> = 62;
    <LALT> = 64;
    <SPCE> = 65;
    <UP> = 111; <LEFT> = 113; <RGHT> = 114; <DOWN> = 116;
};
xkb_types "goggles" {
    type "ONE_LEVEL" {
        modifiers = none;
        level_name[Level1] = "Any";
    };
    type "TWO_LEVEL" {
        modifiers = Shift;
        map[Shift] = Level2;
        level_name[Level1] = "Base";
        level_name[Level2] = "Shift";
    };
};
xkb_compatibility "goggles" {
    interpret Any + AnyOf(all) {
        action = SetMods(modifiers=modMapMods);
    };
};
xkb_symbols "goggles" {
    name[Group1] = "English (US)";
    key <ESC> { [ Escape ] };
    key <AE01> { [ 1, exclam ] };
    key <AE02> { [ 2, at ] };
    key <AE03> { [ 3, numbersign ] };
    key <AE04> { [ 4, dollar ] };
    key <AE05> { [ 5, percent ] };
    key <AE06> { [ 6, asciicircum ] };
    key <AE07> { [ 7, ampersand ] };
    key <AE08> { [ 8, asterisk ] };
    key <AE09> { [ 9, parenleft ] };
    key <AE10> { [ 0, parenright ] };
    key <AE11> { [ minus, underscore ] };
    key <AE12> { [ equal, plus ] };
    key <BKSP> { [ BackSpace ] };
    key <TAB> { [ Tab ] };
    key <AD01> { [ q, Q ] };
    key <AD02> { [ w, W ] };
    key <AD03> { [ e, E ] };
    key <AD04> { [ r, R ] };
    key <AD05> { [ t, T ] };
    key <AD06> { [ y, Y ] };
    key <AD07> { [ u, U ] };
    key <AD08> { [ i, I ] };
    key <AD09> { [ o, O ] };
    key <AD10> { [ p, P ] };
    key <RTRN> { [ Return ] };
    key <LCTL> { [ Control_L ] };
    key <AC01> { [ a, A ] };
    key <AC02> { [ s, S ] };
    key <AC03> { [ d, D ] };
    key <AC04> { [ f, F ] };
    key <AC05> { [ g, G ] };
    key <AC06> { [ h, H ] };
    key <AC07> { [ j, J ] };
    key <AC08> { [ k, K ] };
    key <AC09> { [ l, L ] };
    key <AC10> { [ semicolon, colon ] };
    key <LFSH> { [ Shift_L ] };
    key <AB01> { [ z, Z ] };
    key <AB02> { [ x, X ] };
    key <AB03> { [ c, C ] };
    key <AB04> { [ v, V ] };
    key <AB05> { [ b, B ] };
    key <AB06> { [ n, N ] };
    key <AB07> { [ m, M ] };
    key <AB08> { [ comma, less ] };
    key <AB09> { [ period, greater ] };
    key <AB10> { [ slash, question ] };
    key <RTSH> { [ Shift_R ] };
    key <LALT> { [ Alt_L ] };
    key <SPCE> { [ space ] };
    key <UP> { [ Up ] };
    key <LEFT> { [ Left ] };
    key <RGHT> { [ Right ] };
    key <DOWN> { [ Down ] };
    modifier_map Control { <LCTL> };
    modifier_map Shift { <LFSH>, <RTSH> };
    modifier_map Mod1 { <LALT> };
};
};
"#;

/// Writes the keymap into a fresh sealed memfd. The returned size
/// includes the trailing NUL wl_keyboard expects.
pub(crate) fn keymap_fd() -> io::Result<(OwnedFd, u32)> {
    let fd = unsafe {
        libc::memfd_create(
            c"goggles-keymap".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let bytes = KEYMAP.as_bytes();
    let mut written = 0usize;
    while written < bytes.len() {
        let rc = unsafe {
            libc::write(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        written += rc as usize;
    }
    let nul = [0u8];
    let rc = unsafe {
        libc::write(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            nul.as_ptr() as *const libc::c_void,
            1,
        )
    };
    if rc != 1 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        libc::fcntl(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            libc::F_ADD_SEALS,
            libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE,
        );
    }

    Ok((fd, (bytes.len() + 1) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    fn keymap_fd_is_readable_and_sized() {
        let (fd, size) = keymap_fd().unwrap();
        assert_eq!(size as usize, KEYMAP.len() + 1);

        // Re-read through a dup to make sure the contents landed.
        let dup = fd.try_clone().unwrap();
        unsafe { libc::lseek(dup.as_raw_fd(), 0, libc::SEEK_SET) };
        let mut file = std::fs::File::from(dup);
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len(), size as usize);
        assert!(contents.starts_with(b"xkb_keymap"));
        assert_eq!(*contents.last().unwrap(), 0);
    }

    #[test]
    fn keymap_covers_the_forwarded_keys() {
        // Arrow keys and modifiers must resolve for game input.
        for name in ["<UP>", "<DOWN>", "<LFSH>", "<LCTL>", "<SPCE>", "<RTRN>"] {
            assert!(KEYMAP.contains(name), "missing {name}");
        }
    }
}
