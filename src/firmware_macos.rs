// Every read opens its own registry entry and releases it before returning.

use crate::firmware::{variable_key, FirmwareStore, FirmwareValue};
use libc::{c_char, c_long, c_ulong, c_void};
use std::ffi::CString;
use tracing::{debug, warn};

type MachPort = u32;
type IoRegistryEntry = MachPort;
type CfTypeRef = *const c_void;
type CfAllocatorRef = *const c_void;
type CfTypeId = c_ulong;
type CfIndex = c_long;

// kIOMainPortDefault
const MAIN_PORT_DEFAULT: MachPort = 0;
const MACH_PORT_NULL: MachPort = 0;
const CF_STRING_ENCODING_UTF8: u32 = 0x0800_0100;

const NVRAM_PATH: &str = "IODeviceTree:/options";
const ROM_PATH: &str = "IODeviceTree:/rom";

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IORegistryEntryFromPath(main_port: MachPort, path: *const c_char) -> IoRegistryEntry;
    fn IORegistryEntryCreateCFProperty(
        entry: IoRegistryEntry,
        key: CfTypeRef,
        allocator: CfAllocatorRef,
        options: u32,
    ) -> CfTypeRef;
    fn IOObjectRelease(object: MachPort) -> i32;
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFStringCreateWithCString(
        allocator: CfAllocatorRef,
        c_str: *const c_char,
        encoding: u32,
    ) -> CfTypeRef;
    fn CFRelease(cf: CfTypeRef);
    fn CFGetTypeID(cf: CfTypeRef) -> CfTypeId;
    fn CFDataGetTypeID() -> CfTypeId;
    fn CFStringGetTypeID() -> CfTypeId;
    fn CFDataGetLength(data: CfTypeRef) -> CfIndex;
    fn CFDataGetBytePtr(data: CfTypeRef) -> *const u8;
    fn CFStringGetLength(string: CfTypeRef) -> CfIndex;
    fn CFStringGetMaximumSizeForEncoding(length: CfIndex, encoding: u32) -> CfIndex;
    fn CFStringGetCString(
        string: CfTypeRef,
        buffer: *mut c_char,
        buffer_size: CfIndex,
        encoding: u32,
    ) -> u8;
}

/// Registry entry released on drop.
struct RegistryEntry(IoRegistryEntry);

impl RegistryEntry {
    fn open(path: &str) -> Option<RegistryEntry> {
        let path = CString::new(path).ok()?;
        let entry = unsafe { IORegistryEntryFromPath(MAIN_PORT_DEFAULT, path.as_ptr()) };
        if entry == MACH_PORT_NULL {
            warn!("Registry entry {:?} not found", path);
            None
        } else {
            Some(RegistryEntry(entry))
        }
    }

    fn property(&self, key: &str) -> Option<CfObject> {
        let key = CfObject::string(key)?;
        let value =
            unsafe { IORegistryEntryCreateCFProperty(self.0, key.0, std::ptr::null(), 0) };
        CfObject::from_create_rule(value)
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        unsafe {
            IOObjectRelease(self.0);
        }
    }
}

/// Owned CoreFoundation reference (create rule), released on drop.
struct CfObject(CfTypeRef);

impl CfObject {
    fn from_create_rule(cf: CfTypeRef) -> Option<CfObject> {
        if cf.is_null() {
            None
        } else {
            Some(CfObject(cf))
        }
    }

    fn string(value: &str) -> Option<CfObject> {
        let value = CString::new(value).ok()?;
        let cf = unsafe {
            CFStringCreateWithCString(std::ptr::null(), value.as_ptr(), CF_STRING_ENCODING_UTF8)
        };
        CfObject::from_create_rule(cf)
    }

    fn to_value(&self) -> Option<FirmwareValue> {
        let type_id = unsafe { CFGetTypeID(self.0) };
        if type_id == unsafe { CFDataGetTypeID() } {
            Some(FirmwareValue::Bytes(self.data_bytes()))
        } else if type_id == unsafe { CFStringGetTypeID() } {
            self.string_value().map(FirmwareValue::Text)
        } else {
            debug!("Unsupported CoreFoundation type {}", type_id);
            None
        }
    }

    fn data_bytes(&self) -> Vec<u8> {
        unsafe {
            let length = CFDataGetLength(self.0);
            let ptr = CFDataGetBytePtr(self.0);
            if ptr.is_null() || length <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(ptr, length as usize).to_vec()
        }
    }

    fn string_value(&self) -> Option<String> {
        unsafe {
            let length = CFStringGetLength(self.0);
            let capacity = CFStringGetMaximumSizeForEncoding(length, CF_STRING_ENCODING_UTF8) + 1;
            if capacity <= 0 {
                return None;
            }
            let mut buffer = vec![0u8; capacity as usize];
            if CFStringGetCString(
                self.0,
                buffer.as_mut_ptr() as *mut c_char,
                capacity,
                CF_STRING_ENCODING_UTF8,
            ) == 0
            {
                return None;
            }
            let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
            buffer.truncate(end);
            String::from_utf8(buffer).ok()
        }
    }
}

impl Drop for CfObject {
    fn drop(&mut self) {
        unsafe { CFRelease(self.0) }
    }
}

fn read_property(path: &str, key: &str) -> Option<FirmwareValue> {
    let entry = RegistryEntry::open(path)?;
    let property = entry.property(key)?;
    property.to_value()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IoRegistryStore;

impl FirmwareStore for IoRegistryStore {
    fn read_nvram(&self, namespace: Option<&str>, name: &str) -> Option<FirmwareValue> {
        read_property(NVRAM_PATH, &variable_key(namespace, name))
    }

    fn read_rom(&self, name: &str) -> Option<FirmwareValue> {
        read_property(ROM_PATH, name)
    }
}
