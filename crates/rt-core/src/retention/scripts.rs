//! Text of the generated retention scripts.

use rt_config::AppTarget;

/// addon.d backup/restore hook run by the ROM's backuptool.
pub fn addon_d_script(app: &AppTarget) -> String {
    let name = &app.app_name;
    let pkg = &app.package_identifier;
    let data_dir = app.data_dir.display();
    let data_parent = parent_of(app);
    format!(
        r#"#!/sbin/sh
#
# /system/addon.d/{script}
# Keeps {name} installed across ROM updates.
#
. /tmp/backuptool.functions

list_files() {{
cat <<EOF
app/{name}/{name}.apk
EOF
}}

case "$1" in
  backup)
    list_files | while read FILE REPLACEMENT; do
      backup_file $S/"$FILE"
    done
    if [ -d {data_dir} ]; then
      tar -czf /tmp/{pkg}_data.tar.gz -C {data_parent} {pkg}
    fi
  ;;
  restore)
    list_files | while read FILE REPLACEMENT; do
      R=""
      [ -n "$REPLACEMENT" ] && R="$S/$REPLACEMENT"
      [ -f "$C/$S/$FILE" ] && restore_file $S/"$FILE" "$R"
    done
    if [ -f /tmp/{pkg}_data.tar.gz ]; then
      tar -xzf /tmp/{pkg}_data.tar.gz -C {data_parent}
      chown -R $(stat -c '%u:%g' {data_dir}) {data_dir}
      rm -f /tmp/{pkg}_data.tar.gz
    fi
  ;;
  post-restore)
    if [ -d {data_dir} ]; then
      restorecon -R {data_dir}
    fi
  ;;
esac
"#,
        script = addon_d_script_name(app),
    )
}

pub fn addon_d_script_name(app: &AppTarget) -> String {
    format!("99-{}.sh", app.app_name.to_ascii_lowercase())
}

pub fn installer_zip_name(app: &AppTarget) -> String {
    format!("{}_installer.zip", app.app_name.to_ascii_lowercase())
}

/// Edify script that installs the APK into `/system/app`.
pub fn updater_script(app: &AppTarget) -> String {
    let name = &app.app_name;
    format!(
        r#"ui_print("Installing {name} to /system/app...");
mount("ext4", "EMMC", "/dev/block/bootdevice/by-name/system", "/system");
package_extract_dir("system", "/system");
set_metadata_recursive("/system/app/{name}", "uid", 0, "gid", 0, "dmode", 0755, "fmode", 0644, "capabilities", 0x0, "selabel", "u:object_r:system_file:s0");
unmount("/system");
ui_print("{name} installed.");
"#
    )
}

pub const UPDATE_BINARY: &str = r#"#!/sbin/sh
OUTFD=$2
ZIP=$3

ui_print() {
  echo "ui_print $1" > /proc/self/fd/$OUTFD
  echo "ui_print" > /proc/self/fd/$OUTFD
}

cd /tmp
unzip -o "$ZIP"
sh /tmp/META-INF/com/google/android/updater-script
"#;

pub fn module_prop(app: &AppTarget) -> String {
    format!(
        "id={id}\nname={name} Retention\nversion=v1\nversionCode=1\nauthor=romtools\ndescription=Keeps {name} installed across ROM updates\n",
        id = app.magisk_module_id,
        name = app.app_name,
    )
}

pub fn module_install_script(app: &AppTarget, retained_apk: &str) -> String {
    let name = &app.app_name;
    format!(
        r#"#!/system/bin/sh
MODPATH=${{0%/*}}
mkdir -p $MODPATH/system/app/{name}
cp {retained_apk} $MODPATH/system/app/{name}/{name}.apk
"#
    )
}

fn parent_of(app: &AppTarget) -> String {
    app.data_dir
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_names_follow_app_name() {
        let app = AppTarget::default();
        assert_eq!(addon_d_script_name(&app), "99-romtools.sh");
        assert_eq!(installer_zip_name(&app), "romtools_installer.zip");
    }

    #[test]
    fn test_addon_d_script_mentions_package() {
        let app = AppTarget::default();
        let script = addon_d_script(&app);
        assert!(script.starts_with("#!/sbin/sh"));
        assert!(script.contains("app/RomTools/RomTools.apk"));
        assert!(script.contains("-C /data/data dev.romtools.host"));
        assert!(script.contains("backup_file $S/\"$FILE\""));
    }

    #[test]
    fn test_module_prop_has_id() {
        let prop = module_prop(&AppTarget::default());
        assert!(prop.lines().any(|l| l == "id=romtools_retention"));
    }
}
