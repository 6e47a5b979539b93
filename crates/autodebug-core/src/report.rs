//! Text reports in the style of the SOS debugger extension.
//!
//! Each writer prints one section: runtime summary (`>>> CLR Info`), heap
//! listing and statistics (`!dumpheap` / `!dumpheap -stat`) and AppDomain
//! module listing (`!dumpdomain`).

use std::io::{self, Write};

use crate::{ClrInfo, DataTargetInfo, HeapStatistics, ManagedRuntime, Result};

/// Write the data target summary followed by one block per runtime.
pub fn write_clr_info<W: Write>(
    out: &mut W,
    target: &DataTargetInfo,
    runtimes: &[ClrInfo],
) -> io::Result<()> {
    writeln!(out, ">>> CLR Info")?;
    writeln!(out, "Architecture.: {}", target.architecture)?;
    writeln!(out, "Pointer Size.: {}", target.pointer_size)?;
    writeln!(out, "Display Name.: {}", target.display_name)?;

    for clr in runtimes {
        writeln!(out, "Clr Flavor...: {}", clr.flavor)?;
        writeln!(out, "Clr Version..: {}", clr.version)?;
        writeln!(out, "Filesize.....: {:X}", clr.dac.index_file_size())?;
        writeln!(out, "Timestamp....: {:X}", clr.dac.index_timestamp())?;
        writeln!(out, "Dac File.....: {}", clr.dac.platform_specific_file_name)?;
        if let Some(path) = &clr.dac.local_dac_path {
            writeln!(out, "Local DAC....: {}", path.display())?;
        }
    }
    writeln!(out)
}

/// Write the heap listing (unless `stats_only`) and per-type statistics for
/// every runtime.
pub fn write_heap<W: Write>(
    out: &mut W,
    runtimes: &[Box<dyn ManagedRuntime>],
    stats_only: bool,
) -> Result<()> {
    for runtime in runtimes {
        writeln!(out)?;

        if !stats_only {
            writeln!(out, "{:>16} {:>16} {:>8} {}", "Object", "MethodTable", "Size", "Type")?;
        }

        let mut stats = HeapStatistics::new();
        let mut write_error: Option<io::Error> = None;
        runtime.walk_heap(&mut |object| {
            stats.record(object);
            if stats_only || write_error.is_some() {
                return;
            }
            if let Err(e) = writeln!(
                out,
                "{:016x} {:016x} {:>8} {}",
                object.address, object.method_table, object.size, object.type_name
            ) {
                write_error = Some(e);
            }
        })?;
        if let Some(e) = write_error {
            return Err(e.into());
        }

        write_statistics(out, &stats)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Write the `Statistics:` table and object total.
pub fn write_statistics<W: Write>(out: &mut W, stats: &HeapStatistics) -> io::Result<()> {
    writeln!(out, "\nStatistics:")?;
    writeln!(out, "{:>16} {:>12} {:>12}\t{}", "MethodTable", "Count", "Size", "Type")?;
    for item in stats.sorted() {
        writeln!(
            out,
            "{:016x} {:>12} {:>12}\t{}",
            item.method_table, item.count, item.total_size, item.type_name
        )?;
    }
    writeln!(out, "Total {} objects", stats.total_objects())
}

/// Write every AppDomain of every runtime with its modules.
pub fn write_modules<W: Write>(out: &mut W, runtimes: &[Box<dyn ManagedRuntime>]) -> Result<()> {
    for runtime in runtimes {
        for domain in runtime.app_domains()? {
            writeln!(out, ">>> AppDomain & Modules")?;
            writeln!(out, "ID.....: {}", domain.id)?;
            writeln!(out, "Name...: {}", domain.name)?;
            writeln!(out, "Address: {:016x}", domain.address)?;

            writeln!(out, "\t{:>16} {:>16} {}", "Assembly", "Module", "Module Name")?;
            for module in &domain.modules {
                writeln!(
                    out,
                    "\t{:016x} {:016x} {}",
                    module.assembly_address,
                    module.address,
                    module.display_name()
                )?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        AppDomainInfo, Architecture, ClrFlavor, DacInfo, DacModuleIndex, Error, HeapObject,
        ModuleInfo, ModuleVersion,
    };

    struct FakeRuntime {
        info: ClrInfo,
        objects: Vec<HeapObject>,
        domains: Vec<AppDomainInfo>,
    }

    impl ManagedRuntime for FakeRuntime {
        fn info(&self) -> &ClrInfo {
            &self.info
        }

        fn walk_heap(&self, visit: &mut dyn FnMut(&HeapObject)) -> Result<()> {
            self.objects.iter().for_each(|o| visit(o));
            Ok(())
        }

        fn app_domains(&self) -> Result<Vec<AppDomainInfo>> {
            Ok(self.domains.clone())
        }
    }

    struct BrokenRuntime(ClrInfo);

    impl ManagedRuntime for BrokenRuntime {
        fn info(&self) -> &ClrInfo {
            &self.0
        }

        fn walk_heap(&self, _visit: &mut dyn FnMut(&HeapObject)) -> Result<()> {
            Err(Error::DacQuery("GetGCHeapData failed: 0x80004005".into()))
        }

        fn app_domains(&self) -> Result<Vec<AppDomainInfo>> {
            Err(Error::DacQuery("GetAppDomainStoreData failed: 0x80004005".into()))
        }
    }

    fn core_info(local_dac: Option<&str>) -> ClrInfo {
        ClrInfo {
            flavor: ClrFlavor::Core,
            version: ModuleVersion {
                major: 4,
                minor: 700,
                build: 20,
                revision: 20201,
            },
            module_base: 0x7ffb_0500_0000,
            module_path: PathBuf::from(r"C:\dotnet\coreclr.dll"),
            dac: DacInfo {
                index: DacModuleIndex {
                    timestamp: 0x5E86_7108,
                    size_of_image: 0x56C000,
                },
                platform_specific_file_name: "mscordaccore_Amd64_Amd64_4.700.20.20201.dll".into(),
                local_dac_path: local_dac.map(PathBuf::from),
            },
        }
    }

    fn object(address: u64, method_table: u64, size: u64, name: &str) -> HeapObject {
        HeapObject {
            address,
            method_table,
            size,
            type_name: name.into(),
        }
    }

    fn fake_runtime() -> Box<dyn ManagedRuntime> {
        Box::new(FakeRuntime {
            info: core_info(None),
            objects: vec![
                object(0x1d1445a1000, 0x1d13e08bf90, 24, "Free"),
                object(0x1d1445a1018, 0x1d13e08bf90, 24, "Free"),
                object(0x1d1445a1048, 0x7ffb05430638, 152, "System.RuntimeType+RuntimeTypeCache"),
            ],
            domains: vec![AppDomainInfo {
                id: 1,
                name: "clrhost".into(),
                address: 0x1d13e0423c0,
                modules: vec![
                    ModuleInfo::new(0x1d143f66b80, 0x7ffb05214020, r"C:\dotnet\System.Private.CoreLib.dll"),
                    ModuleInfo::new(0x1d58f172800, 0x7ffb05f92040, ""),
                ],
            }],
        })
    }

    fn render<F>(f: F) -> String
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let mut out = Vec::new();
        f(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn clr_info_section() {
        let target = DataTargetInfo {
            architecture: Architecture::Amd64,
            pointer_size: 8,
            display_name: "DbgEng, IDebugClient = 1a4fe703148".into(),
        };
        let text = render(|out| {
            write_clr_info(out, &target, &[core_info(Some(r"C:\dotnet\mscordaccore.dll"))]).unwrap()
        });

        let expected = "\
>>> CLR Info
Architecture.: Amd64
Pointer Size.: 8
Display Name.: DbgEng, IDebugClient = 1a4fe703148
Clr Flavor...: Core
Clr Version..: 4.700.20.20201
Filesize.....: 56C000
Timestamp....: 5E867108
Dac File.....: mscordaccore_Amd64_Amd64_4.700.20.20201.dll
Local DAC....: C:\\dotnet\\mscordaccore.dll

";
        assert_eq!(text, expected);
    }

    #[test]
    fn clr_info_without_runtimes_or_local_dac() {
        let target = DataTargetInfo {
            architecture: Architecture::X86,
            pointer_size: 4,
            display_name: "DbgEng, IDebugClient = 10".into(),
        };
        let text = render(|out| write_clr_info(out, &target, &[]).unwrap());
        assert_eq!(
            text,
            ">>> CLR Info\nArchitecture.: X86\nPointer Size.: 4\nDisplay Name.: DbgEng, IDebugClient = 10\n\n"
        );

        let text = render(|out| write_clr_info(out, &target, &[core_info(None)]).unwrap());
        assert!(!text.contains("Local DAC"));
    }

    #[test]
    fn heap_listing_and_statistics() {
        let runtimes = vec![fake_runtime()];
        let text = render(|out| write_heap(out, &runtimes, false).unwrap());

        let expected = "
          Object      MethodTable     Size Type
000001d1445a1000 000001d13e08bf90       24 Free
000001d1445a1018 000001d13e08bf90       24 Free
000001d1445a1048 00007ffb05430638      152 System.RuntimeType+RuntimeTypeCache

Statistics:
     MethodTable        Count         Size\tType
000001d13e08bf90            2           48\tFree
00007ffb05430638            1          152\tSystem.RuntimeType+RuntimeTypeCache
Total 3 objects

";
        assert_eq!(text, expected);
    }

    #[test]
    fn heap_statistics_only() {
        let runtimes = vec![fake_runtime()];
        let text = render(|out| write_heap(out, &runtimes, true).unwrap());

        assert!(!text.contains("Object      MethodTable"));
        assert!(!text.contains("000001d1445a1000"));
        assert!(text.starts_with("\n\nStatistics:\n"));
        assert!(text.ends_with("Total 3 objects\n\n"));
    }

    #[test]
    fn heap_without_runtimes_prints_blank_line() {
        let text = render(|out| write_heap(out, &[], false).unwrap());
        assert_eq!(text, "\n");
    }

    #[test]
    fn heap_walk_failure_is_reported() {
        let runtimes: Vec<Box<dyn ManagedRuntime>> = vec![Box::new(BrokenRuntime(core_info(None)))];
        let mut out = Vec::new();
        let err = write_heap(&mut out, &runtimes, false).unwrap_err();
        assert!(err.to_string().contains("GetGCHeapData"));
    }

    #[test]
    fn module_listing() {
        let runtimes = vec![fake_runtime()];
        let text = render(|out| write_modules(out, &runtimes).unwrap());

        let expected = "\
>>> AppDomain & Modules
ID.....: 1
Name...: clrhost
Address: 000001d13e0423c0
\t        Assembly           Module Module Name
\t000001d143f66b80 00007ffb05214020 C:\\dotnet\\System.Private.CoreLib.dll
\t000001d58f172800 00007ffb05f92040 [Dynamic Module]


";
        assert_eq!(text, expected);
    }

    #[test]
    fn module_listing_failure_is_reported() {
        let runtimes: Vec<Box<dyn ManagedRuntime>> = vec![Box::new(BrokenRuntime(core_info(None)))];
        let mut out = Vec::new();
        assert!(write_modules(&mut out, &runtimes).is_err());
        assert!(out.is_empty());
    }
}
